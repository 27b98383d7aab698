pub mod api;
pub mod cli;
pub mod engine;
pub mod probes;
pub mod trackers;
