pub mod autoscale;
pub mod client;
pub mod config;
pub mod fleet;
pub mod humanize;
pub mod observability;
pub mod signer;
pub mod tracker;
