// SPDX-License-Identifier: MIT
//
// Drahtwerk — bridge runtime: the WebSocket transport adapters attach to,
// the hardware/proxy/API service adapters themselves, the lifecycle
// supervisor composing them, and the single-instance lock.

pub mod instance;
pub mod services;
pub mod supervisor;
pub mod transport;
pub mod wiring;

pub use instance::InstanceLock;
pub use services::BridgeService;
pub use supervisor::{BridgeWiring, Supervisor, SupervisorHandle};
pub use transport::{ChannelHandler, ClientHandle, Transport, WsTransport};
pub use wiring::DefaultWiring;
