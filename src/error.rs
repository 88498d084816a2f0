use crate::{isup::Cic, q931::CallRef, session::SessionKey, tdm::SpanId};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(#[from] rsip::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("TDM link error: {0}: span {1}")]
    TdmLinkError(String, SpanId),

    #[error("LAPD error: {0}: span {1}")]
    LapdError(String, SpanId),

    #[error("Q.931 codec error: {0}")]
    Q931CodecError(String),

    #[error("call error: {0}: {1}")]
    CallError(String, CallRef),

    #[error("ISUP error: {0}: CIC {1}")]
    IsupError(String, Cic),

    #[error("NFAS group error: {0}: group {1}")]
    NfasError(String, u32),

    #[error("translation error: {0}")]
    TranslateError(String),

    #[error("session key collision: {0}")]
    KeyCollision(SessionKey),

    #[error("session not found: {0}")]
    SessionNotFound(SessionKey),

    #[error("RTP port range exhausted")]
    NoPortsAvailable,

    #[error("CIC range exhausted")]
    CicExhausted,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("error: {0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSendError(e.to_string())
    }
}
