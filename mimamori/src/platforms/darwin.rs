mod core_foundation;
pub mod fsevents;
