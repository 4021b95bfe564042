//! Market Feed Adapters
//!
//! Everything between the socket and the application services:
//!
//! - **Transport**: WebSocket connector and an in-memory loopback
//! - **Codec**: JSON wire frames, validated at decode time
//! - **Connection**: handshake, replay, heartbeat and reconnection

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod loopback;
pub mod messages;
pub mod reconnect;
pub mod websocket;

pub use codec::{CodecError, JsonCodec};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use loopback::{LoopbackConnector, LoopbackServer};
pub use messages::{ClientFrame, ServerFrame, SubscriptionBody};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use websocket::WebSocketConnector;
