pub mod inotify;
