pub mod client;

pub use client::{OutboundRequest, UpstreamClient, UpstreamReply, UpstreamTimeouts};
