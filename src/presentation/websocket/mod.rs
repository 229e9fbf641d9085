//! WebSocket Gateway
//!
//! Real-time chat over WebSocket connections.
//!
//! - **connection**: one live socket, its outbound queue and lifecycle
//! - **manager**: the index of live connections and per-user fan-out
//! - **router**: inbound frame dispatch
//! - **messages**: the JSON wire format

pub mod connection;
pub mod handler;
pub mod manager;
pub mod messages;
pub mod router;

pub use connection::{CloseReason, Connection, ConnectionError, ConnectionState};
pub use handler::ws_handler;
pub use manager::{BroadcastReport, ConnectionManager};
pub use messages::{MessageType, WireMessage};
pub use router::{Collaborators, MessageRouter, RouterConfig};
