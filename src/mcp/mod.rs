//! JSON-RPC peer protocol: dispatch, per-request context, and the
//! per-session capability cache.

pub mod capabilities;
pub mod context;
pub mod server;
pub mod stdio;

pub use capabilities::{CapabilityCache, PeerCapabilities};
pub use context::RequestContext;
