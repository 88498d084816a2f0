//! TDM link abstraction.
//!
//! The gateway core never touches span hardware. It speaks to a
//! [`TdmConnection`]: a frame source/sink that exposes numbered channels
//! and delivers the D-channel octet stream as events. Production
//! deployments use the TDMoE transport; tests use the in-memory channel
//! link, which behaves identically without sockets.

use crate::Result;
use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod channel;
pub mod tdmoe;

pub use channel::ChannelLink;
pub use tdmoe::{TdmoeFrame, TdmoeFrameType, TdmoeLink};

/// Physical span identifier.
pub type SpanId = u32;

pub type TdmEventSender = UnboundedSender<TdmEvent>;
pub type TdmEventReceiver = UnboundedReceiver<TdmEvent>;

/// Events a link delivers upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TdmEvent {
    /// Octets received on a channel (the D-channel slot carries LAPD).
    Frame { channel: u16, payload: Bytes },
    ChannelUp { channel: u16 },
    ChannelDown { channel: u16 },
}

/// One TDM transport, unified over its implementations.
#[derive(Clone)]
pub enum TdmConnection {
    Tdmoe(TdmoeLink),
    Channel(ChannelLink),
}

impl TdmConnection {
    pub async fn send(&self, channel: u16, payload: Bytes) -> Result<()> {
        match self {
            TdmConnection::Tdmoe(link) => link.send(channel, payload).await,
            TdmConnection::Channel(link) => link.send(channel, payload).await,
        }
    }

    /// Receiver for link events; callable once per link.
    pub fn take_events(&self) -> Option<TdmEventReceiver> {
        match self {
            TdmConnection::Tdmoe(link) => link.take_events(),
            TdmConnection::Channel(link) => link.take_events(),
        }
    }
}

impl std::fmt::Display for TdmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TdmConnection::Tdmoe(link) => write!(f, "tdmoe:{}", link),
            TdmConnection::Channel(_) => write!(f, "channel:*"),
        }
    }
}
