//! HTTP API surface

pub mod activitypub;
pub mod client;
pub mod metrics;
pub mod wellknown;
