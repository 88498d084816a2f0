//! TDM over Ethernet transport.
//!
//! UDP-carried span frames: a 12-octet header (magic, version, frame type,
//! channel, sequence, timestamp) followed by the channel payload. The
//! D-channel slot carries raw LAPD octets; idle supervision raises
//! ChannelUp/ChannelDown as traffic appears and disappears.

use super::{TdmEvent, TdmEventReceiver, TdmEventSender};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

const TDMOE_MAGIC: u16 = 0x7A7A;
const TDMOE_VERSION: u8 = 1;
const TDMOE_HEADER_LEN: usize = 12;

const SUPERVISION_INTERVAL: Duration = Duration::from_secs(5);
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdmoeFrameType {
    Voice,
    Control,
    Keepalive,
    Other(u8),
}

impl TdmoeFrameType {
    fn code(&self) -> u8 {
        match self {
            TdmoeFrameType::Voice => 0x00,
            TdmoeFrameType::Control => 0x01,
            TdmoeFrameType::Keepalive => 0x04,
            TdmoeFrameType::Other(code) => *code,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0x00 => TdmoeFrameType::Voice,
            0x01 => TdmoeFrameType::Control,
            0x04 => TdmoeFrameType::Keepalive,
            other => TdmoeFrameType::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdmoeFrame {
    pub frame_type: TdmoeFrameType,
    pub channel: u16,
    pub sequence: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl TdmoeFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TDMOE_HEADER_LEN + self.payload.len());
        buf.put_u16(TDMOE_MAGIC);
        buf.put_u8(TDMOE_VERSION);
        buf.put_u8(self.frame_type.code());
        buf.put_u16(self.channel);
        buf.put_u32(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<TdmoeFrame> {
        if data.len() < TDMOE_HEADER_LEN {
            return Err(Error::Error("TDMoE frame too short".to_string()));
        }
        if data.get_u16() != TDMOE_MAGIC {
            return Err(Error::Error("bad TDMoE magic".to_string()));
        }
        if data.get_u8() != TDMOE_VERSION {
            return Err(Error::Error("unsupported TDMoE version".to_string()));
        }
        let frame_type = TdmoeFrameType::from_code(data.get_u8());
        let channel = data.get_u16();
        let sequence = data.get_u32();
        let timestamp = data.get_u32();
        Ok(TdmoeFrame {
            frame_type,
            channel,
            sequence,
            timestamp,
            payload: data,
        })
    }
}

struct TdmoeLinkInner {
    socket: UdpSocket,
    remote: Mutex<Option<SocketAddr>>,
    sequence: AtomicU32,
    last_seen: Mutex<HashMap<u16, Instant>>,
    event_tx: TdmEventSender,
    events: Mutex<Option<TdmEventReceiver>>,
    keepalive: Duration,
}

#[derive(Clone)]
pub struct TdmoeLink {
    inner: Arc<TdmoeLinkInner>,
}

impl TdmoeLink {
    pub async fn create_connection(
        local: SocketAddr,
        remote: Option<SocketAddr>,
        keepalive: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let link = TdmoeLink {
            inner: Arc::new(TdmoeLinkInner {
                socket,
                remote: Mutex::new(remote),
                sequence: AtomicU32::new(0),
                last_seen: Mutex::new(HashMap::new()),
                event_tx,
                events: Mutex::new(Some(event_rx)),
                keepalive,
            }),
        };
        info!("created TDMoE link: {} remote: {:?}", link, remote);
        Ok(link)
    }

    pub fn take_events(&self) -> Option<TdmEventReceiver> {
        self.inner.events.lock().ok()?.take()
    }

    /// Receive loop plus supervision; run until the socket errors or the
    /// caller drops the future.
    pub async fn serve_loop(&self) -> Result<()> {
        let mut buf = vec![0u8; 2048];
        let mut supervision = tokio::time::interval(SUPERVISION_INTERVAL);
        let mut keepalive = tokio::time::interval(self.inner.keepalive.max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                received = self.inner.socket.recv_from(&mut buf) => {
                    let (len, source) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("TDMoE receive error: {}", e);
                            continue;
                        }
                    };
                    self.on_datagram(&buf[..len], source);
                }
                _ = supervision.tick() => {
                    self.expire_channels();
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.send_keepalive().await {
                        debug!("keepalive failed: {}", e);
                    }
                }
            }
        }
    }

    fn on_datagram(&self, data: &[u8], source: SocketAddr) {
        let frame = match TdmoeFrame::decode(Bytes::copy_from_slice(data)) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping TDMoE datagram from {}: {}", source, e);
                return;
            }
        };

        // Learn the peer address from its traffic when not configured.
        if let Ok(mut remote) = self.inner.remote.lock() {
            if remote.is_none() {
                *remote = Some(source);
            }
        }

        if frame.frame_type == TdmoeFrameType::Keepalive {
            trace!("keepalive from {}", source);
            return;
        }

        self.note_activity(frame.channel);
        trace!(
            channel = frame.channel,
            len = frame.payload.len(),
            "rx TDMoE frame"
        );
        let _ = self.inner.event_tx.send(TdmEvent::Frame {
            channel: frame.channel,
            payload: frame.payload,
        });
    }

    fn note_activity(&self, channel: u16) {
        if let Ok(mut seen) = self.inner.last_seen.lock() {
            if seen.insert(channel, Instant::now()).is_none() {
                let _ = self.inner.event_tx.send(TdmEvent::ChannelUp { channel });
            }
        }
    }

    fn expire_channels(&self) {
        let now = Instant::now();
        if let Ok(mut seen) = self.inner.last_seen.lock() {
            let stale: Vec<u16> = seen
                .iter()
                .filter(|(_, at)| now.duration_since(**at) > CHANNEL_TIMEOUT)
                .map(|(channel, _)| *channel)
                .collect();
            for channel in stale {
                seen.remove(&channel);
                debug!(channel, "TDMoE channel timed out");
                let _ = self.inner.event_tx.send(TdmEvent::ChannelDown { channel });
            }
        }
    }

    pub async fn send(&self, channel: u16, payload: Bytes) -> Result<()> {
        let frame = TdmoeFrame {
            frame_type: TdmoeFrameType::Voice,
            channel,
            sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now().timestamp() as u32,
            payload,
        };
        self.send_frame(frame).await
    }

    async fn send_keepalive(&self) -> Result<()> {
        self.send_frame(TdmoeFrame {
            frame_type: TdmoeFrameType::Keepalive,
            channel: 0,
            sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now().timestamp() as u32,
            payload: Bytes::new(),
        })
        .await
    }

    async fn send_frame(&self, frame: TdmoeFrame) -> Result<()> {
        let remote = self
            .inner
            .remote
            .lock()
            .ok()
            .and_then(|r| *r)
            .ok_or_else(|| Error::Error("no TDMoE peer address".to_string()))?;
        let data = frame.encode();
        trace!(
            channel = frame.channel,
            len = data.len(),
            "tx TDMoE frame to {}",
            remote
        );
        self.inner.socket.send_to(&data, remote).await?;
        Ok(())
    }
}

impl std::fmt::Display for TdmoeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.socket.local_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "*:*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let frame = TdmoeFrame {
            frame_type: TdmoeFrameType::Voice,
            channel: 16,
            sequence: 7,
            timestamp: 1234,
            payload: Bytes::from_static(b"lapd octets"),
        };
        let decoded = TdmoeFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut data = BytesMut::new();
        data.put_u16(0x1234);
        data.put_u8(TDMOE_VERSION);
        data.put_u8(0);
        data.put_u16(1);
        data.put_u32(0);
        data.put_u32(0);
        assert!(TdmoeFrame::decode(data.freeze()).is_err());
    }

    #[test]
    fn test_rejects_short_datagram() {
        assert!(TdmoeFrame::decode(Bytes::from_static(&[0x7A, 0x7A, 0x01])).is_err());
    }

    #[tokio::test]
    async fn test_link_pair_over_loopback() {
        let a = TdmoeLink::create_connection(
            "127.0.0.1:0".parse().unwrap(),
            None,
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        let b_local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a_addr = a.inner.socket.local_addr().unwrap();
        let b = TdmoeLink::create_connection(b_local, Some(a_addr), Duration::from_secs(30))
            .await
            .unwrap();

        let mut a_events = a.take_events().unwrap();
        let a_serve = a.clone();
        tokio::spawn(async move { a_serve.serve_loop().await });

        b.send(16, Bytes::from_static(b"hello")).await.unwrap();

        let up = a_events.recv().await.unwrap();
        assert_eq!(up, TdmEvent::ChannelUp { channel: 16 });
        let frame = a_events.recv().await.unwrap();
        assert_eq!(
            frame,
            TdmEvent::Frame {
                channel: 16,
                payload: Bytes::from_static(b"hello")
            }
        );
    }
}
