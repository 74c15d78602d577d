pub mod backoff;
pub mod client;
pub mod protocol;

pub use backoff::ReconnectPolicy;
pub use client::{ClientTimings, PushHandler, UpstreamClient};
