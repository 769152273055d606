//! Transport implementations: WebSocket for real clients, in-memory pairs
//! for tests and embedding.

pub mod memory;
pub mod websocket;

pub use memory::{pair, ClientFrame, MemoryClient, MemoryPeer, MemoryTransport, ServerFrame};
pub use websocket::{start_listener, WebSocketTransport};
