//! # Relay Transport
//!
//! One persistent WebSocket to the conversational relay per voice session.
//!
//! ## Key Components:
//! - **messages**: outbound framing per wire dialect, inbound envelope parsing
//! - **reconnect**: exponential backoff policy
//! - **session**: the connection state machine, reader and writer

pub mod messages;
pub mod reconnect;
pub mod session;

pub use messages::{FunctionCall, Inbound, Outbound, ToolAck, UpstreamMessage, WireDialect};
pub use reconnect::ReconnectPolicy;
pub use session::{TransportEvent, TransportSession, TransportStats};
