// A TDM (PRI/ISUP) to SIP signaling gateway core in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod call;
pub mod config;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod isup;
pub mod lapd;
pub mod nfas;
pub mod q850;
pub mod q931;
pub mod rtp;
pub mod session;
pub mod tdm;
pub mod timer;
pub mod translate;
pub use gateway::GatewayBuilder;
