//! Session registry: one call correlated across protocols.
//!
//! A session is reachable by any of four keys: Q.931 call reference
//! (scoped to its D-channel endpoint), ISUP CIC, SIP Call-ID, and the local
//! RTP port. Insert is atomic across the presented keys; the record lives
//! until the last key is released.

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

pub type SessionId = u64;

/// One of the four correlation keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Call reference value qualified by its D-channel endpoint.
    CallRef { endpoint: String, value: u16 },
    Cic(u16),
    SipCallId(String),
    RtpPort(u16),
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::CallRef { endpoint, value } => {
                write!(f, "call-ref {}/0x{:04x}", endpoint, value)
            }
            SessionKey::Cic(cic) => write!(f, "cic {}", cic),
            SessionKey::SipCallId(id) => write!(f, "call-id {}", id),
            SessionKey::RtpPort(port) => write!(f, "rtp {}", port),
        }
    }
}

/// Read-only view of a session's bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub call_ref: Option<(String, u16)>,
    pub cic: Option<u16>,
    pub sip_call_id: Option<String>,
    pub rtp_port: Option<u16>,
}

#[derive(Default)]
struct SessionRecord {
    call_ref: Option<(String, u16)>,
    cic: Option<u16>,
    sip_call_id: Option<String>,
    rtp_port: Option<u16>,
}

impl SessionRecord {
    fn key_count(&self) -> usize {
        self.call_ref.is_some() as usize
            + self.cic.is_some() as usize
            + self.sip_call_id.is_some() as usize
            + self.rtp_port.is_some() as usize
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: SessionId,
    sessions: HashMap<SessionId, SessionRecord>,
    by_key: HashMap<SessionKey, SessionId>,
}

/// The lock is held only for the duration of one operation; nothing
/// suspends while holding it.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            inner: RwLock::new(RegistryInner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a session bound to the given keys. If any key is already in
    /// use the insert fails whole and no state changes.
    pub fn insert(&self, keys: &[SessionKey]) -> Result<SessionId> {
        if keys.is_empty() {
            return Err(Error::Error("session needs at least one key".to_string()));
        }
        let mut inner = self.write()?;
        for key in keys {
            if inner.by_key.contains_key(key) {
                return Err(Error::KeyCollision(key.clone()));
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let mut record = SessionRecord::default();
        for key in keys {
            apply_key(&mut record, key);
            inner.by_key.insert(key.clone(), id);
        }
        inner.sessions.insert(id, record);
        debug!(session = id, keys = keys.len(), "session created");
        Ok(id)
    }

    /// Attach an additional key to the session that `existing` resolves to.
    pub fn bind(&self, existing: &SessionKey, new_key: SessionKey) -> Result<()> {
        let mut inner = self.write()?;
        let id = *inner
            .by_key
            .get(existing)
            .ok_or_else(|| Error::SessionNotFound(existing.clone()))?;
        if inner.by_key.contains_key(&new_key) {
            return Err(Error::KeyCollision(new_key));
        }
        if let Some(record) = inner.sessions.get_mut(&id) {
            apply_key(record, &new_key);
        }
        inner.by_key.insert(new_key, id);
        Ok(())
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<SessionSnapshot> {
        let inner = self.inner.read().ok()?;
        let id = *inner.by_key.get(key)?;
        inner.sessions.get(&id).map(|record| SessionSnapshot {
            id,
            call_ref: record.call_ref.clone(),
            cic: record.cic,
            sip_call_id: record.sip_call_id.clone(),
            rtp_port: record.rtp_port,
        })
    }

    /// Release one key. Returns the snapshot of the session as it was when
    /// the last key went away, `None` while keys remain.
    pub fn release(&self, key: &SessionKey) -> Result<Option<SessionSnapshot>> {
        let mut inner = self.write()?;
        let id = inner
            .by_key
            .remove(key)
            .ok_or_else(|| Error::SessionNotFound(key.clone()))?;

        let record = match inner.sessions.get_mut(&id) {
            Some(record) => record,
            None => return Ok(None),
        };
        match key {
            SessionKey::CallRef { .. } => record.call_ref = None,
            SessionKey::Cic(_) => record.cic = None,
            SessionKey::SipCallId(_) => record.sip_call_id = None,
            SessionKey::RtpPort(_) => record.rtp_port = None,
        }
        if record.key_count() == 0 {
            let record = inner.sessions.remove(&id);
            debug!(session = id, "session destroyed");
            return Ok(record.map(|r| SessionSnapshot {
                id,
                call_ref: r.call_ref,
                cic: r.cic,
                sip_call_id: r.sip_call_id,
                rtp_port: r.rtp_port,
            }));
        }
        Ok(None)
    }

    /// Drop a whole session by any one of its keys, releasing all bindings.
    pub fn remove(&self, key: &SessionKey) -> Result<SessionSnapshot> {
        let mut inner = self.write()?;
        let id = *inner
            .by_key
            .get(key)
            .ok_or_else(|| Error::SessionNotFound(key.clone()))?;
        let record = inner
            .sessions
            .remove(&id)
            .ok_or_else(|| Error::SessionNotFound(key.clone()))?;

        let snapshot = SessionSnapshot {
            id,
            call_ref: record.call_ref.clone(),
            cic: record.cic,
            sip_call_id: record.sip_call_id.clone(),
            rtp_port: record.rtp_port,
        };
        if let Some((endpoint, value)) = record.call_ref {
            inner.by_key.remove(&SessionKey::CallRef { endpoint, value });
        }
        if let Some(cic) = record.cic {
            inner.by_key.remove(&SessionKey::Cic(cic));
        }
        if let Some(call_id) = record.sip_call_id {
            inner.by_key.remove(&SessionKey::SipCallId(call_id));
        }
        if let Some(port) = record.rtp_port {
            inner.by_key.remove(&SessionKey::RtpPort(port));
        }
        debug!(session = id, "session removed");
        Ok(snapshot)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| Error::Error("session registry poisoned".to_string()))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_key(record: &mut SessionRecord, key: &SessionKey) {
    match key {
        SessionKey::CallRef { endpoint, value } => {
            record.call_ref = Some((endpoint.clone(), *value))
        }
        SessionKey::Cic(cic) => record.cic = Some(*cic),
        SessionKey::SipCallId(id) => record.sip_call_id = Some(id.clone()),
        SessionKey::RtpPort(port) => record.rtp_port = Some(*port),
    }
}
