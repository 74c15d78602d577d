pub mod auth;
pub mod protocol;
pub mod server;

pub use protocol::{CommandEnvelope, EventEnvelope, ResponseEnvelope};
pub use server::{ClientInfo, DownstreamServer, InboundCommand};
