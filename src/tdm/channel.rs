//! In-memory TDM link for tests and loopback wiring.
//!
//! Two halves created as a pair: what one half sends, the other receives
//! as a [`TdmEvent::Frame`]. Deterministic, no sockets, no timing.

use super::{TdmEvent, TdmEventReceiver, TdmEventSender};
use crate::Result;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

struct ChannelLinkInner {
    peer_tx: TdmEventSender,
    events: Mutex<Option<TdmEventReceiver>>,
}

#[derive(Clone)]
pub struct ChannelLink {
    inner: Arc<ChannelLinkInner>,
}

impl ChannelLink {
    /// Two connected halves.
    pub fn pair() -> (ChannelLink, ChannelLink) {
        let (a_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
        let (b_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
        let a = ChannelLink {
            inner: Arc::new(ChannelLinkInner {
                peer_tx: b_tx,
                events: Mutex::new(Some(a_rx)),
            }),
        };
        let b = ChannelLink {
            inner: Arc::new(ChannelLinkInner {
                peer_tx: a_tx,
                events: Mutex::new(Some(b_rx)),
            }),
        };
        (a, b)
    }

    pub async fn send(&self, channel: u16, payload: Bytes) -> Result<()> {
        self.inner
            .peer_tx
            .send(TdmEvent::Frame { channel, payload })
            .map_err(|e| e.into())
    }

    pub fn take_events(&self) -> Option<TdmEventReceiver> {
        self.inner.events.lock().ok()?.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_frames_both_ways() {
        let (a, b) = ChannelLink::pair();
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        a.send(16, Bytes::from_static(b"to-b")).await.unwrap();
        b.send(16, Bytes::from_static(b"to-a")).await.unwrap();

        assert_eq!(
            b_events.recv().await,
            Some(TdmEvent::Frame {
                channel: 16,
                payload: Bytes::from_static(b"to-b")
            })
        );
        assert_eq!(
            a_events.recv().await,
            Some(TdmEvent::Frame {
                channel: 16,
                payload: Bytes::from_static(b"to-a")
            })
        );
    }

    #[tokio::test]
    async fn test_events_takeable_once() {
        let (a, _b) = ChannelLink::pair();
        assert!(a.take_events().is_some());
        assert!(a.take_events().is_none());
    }
}
