pub mod actors;
pub mod config;
pub mod domain;
pub mod event_sourcing;
pub mod forwarding;
pub mod messaging;
pub mod metrics;
pub mod replay;
pub mod utils;
