pub mod readdirectorychangesw;
