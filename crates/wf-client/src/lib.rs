//! Client side of the shell: the shared control channel, the reconnect
//! loop and the per-project stream subscriptions.

mod agent;
mod channel;
mod error;
mod reconnect;
mod subscriptions;

pub use agent::AgentStreams;
pub use channel::ControlChannel;
pub use error::ChannelError;
pub use reconnect::{ConnectionState, Connector, DaemonConnector, ReconnectController};
pub use subscriptions::{
    EventStream, StreamEnd, StreamEvent, StreamKind, StreamSource, SubscriptionManager,
};
