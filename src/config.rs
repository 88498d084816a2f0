//! Gateway configuration.
//!
//! Loaded once at startup from TOML and treated as read-only thereafter.
//! Defaults follow the protocol constants (Q.921 timer values, Q.764 CIC
//! ranges) so a minimal file only names spans and addresses.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub tdm: TdmConfig,
    #[serde(default)]
    pub pri: PriConfig,
    #[serde(default)]
    pub isup: IsupConfig,
    #[serde(default)]
    pub nfas: NfasConfig,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub rtp: RtpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub max_calls: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: "tdmgate".to_string(),
            max_calls: 1000,
        }
    }
}

/// One physical span carried over the TDM link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanConfig {
    pub span_id: u32,
    /// Time slot carrying the D-channel (16 for E1, 24 for T1).
    pub d_channel: u16,
    pub layer1: Layer1Type,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TdmConfig {
    pub bind_addr: SocketAddr,
    pub remote_addr: Option<SocketAddr>,
    pub spans: Vec<SpanConfig>,
    /// Keepalive interval in seconds; 0 disables.
    pub keepalive_secs: u64,
}

impl Default for TdmConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2427".parse().expect("static addr"),
            remote_addr: None,
            spans: vec![SpanConfig {
                span_id: 1,
                d_channel: 16,
                layer1: Layer1Type::E1,
            }],
            keepalive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer1Type {
    #[serde(rename = "e1")]
    E1,
    #[serde(rename = "t1")]
    T1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriConfig {
    pub variant: Variant,
    pub sapi: u8,
    pub tei: u8,
    /// Transmit window k.
    pub window: u8,
    pub t200_ms: u64,
    pub t203_ms: u64,
    pub n200: u8,
}

impl Default for PriConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Itu,
            sapi: 0,
            tei: 0,
            window: 7,
            t200_ms: 1000,
            t203_ms: 10000,
            n200: 3,
        }
    }
}

/// Protocol variant selecting the translation rule set and number formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    #[serde(rename = "itu")]
    Itu,
    #[serde(rename = "ansi")]
    Ansi,
    #[serde(rename = "etsi")]
    Etsi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsupConfig {
    pub enabled: bool,
    pub cic_min: u16,
    pub cic_max: u16,
    pub local_point_code: u32,
    pub remote_point_code: u32,
}

impl Default for IsupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cic_min: 1,
            cic_max: 1000,
            local_point_code: 0,
            remote_point_code: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfasGroupConfig {
    pub group_id: u32,
    /// Ordered span list; the first entry is the primary.
    pub spans: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfasConfig {
    pub enabled: bool,
    pub groups: Vec<NfasGroupConfig>,
    pub heartbeat_mode: HeartbeatMode,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_loss_threshold: u32,
    pub switchover_timeout_ms: u64,
    pub max_switchover_attempts: u32,
    pub replay_queue_depth: usize,
}

impl Default for NfasConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            groups: Vec::new(),
            heartbeat_mode: HeartbeatMode::LinkPoll,
            heartbeat_interval_ms: 1000,
            heartbeat_loss_threshold: 3,
            switchover_timeout_ms: 5000,
            max_switchover_attempts: 3,
            replay_queue_depth: 64,
        }
    }
}

/// How an NFAS group supervises the active D-channel.
///
/// `LinkPoll` probes at Layer 2 with RR(P=1). `StatusEnquiry` sends a Q.931
/// STATUS ENQUIRY for switches that expect the call-control probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatMode {
    #[serde(rename = "link-poll")]
    LinkPoll,
    #[serde(rename = "status-enquiry")]
    StatusEnquiry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub domain: String,
    /// Address advertised in SDP c-lines for gateway-side media.
    pub media_addr: IpAddr,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            domain: "tdmgate.local".to_string(),
            media_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    pub port_min: u16,
    pub port_max: u16,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            port_min: 10000,
            port_max: 20000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            tdm: TdmConfig::default(),
            pri: PriConfig::default(),
            isup: IsupConfig::default(),
            nfas: NfasConfig::default(),
            sip: SipConfig::default(),
            rtp: RtpConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig =
            toml::from_str(&contents).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tdm.spans.is_empty() {
            return Err(Error::ConfigError("no spans configured".to_string()));
        }
        if self.rtp.port_min >= self.rtp.port_max {
            return Err(Error::ConfigError(format!(
                "invalid RTP port range {}..{}",
                self.rtp.port_min, self.rtp.port_max
            )));
        }
        if self.rtp.port_min % 2 != 0 {
            return Err(Error::ConfigError(
                "RTP port range must start on an even port".to_string(),
            ));
        }
        if self.isup.cic_min == 0 || self.isup.cic_min > self.isup.cic_max {
            return Err(Error::ConfigError(format!(
                "invalid CIC range {}..{}",
                self.isup.cic_min, self.isup.cic_max
            )));
        }
        if self.isup.cic_max >= 1 << 14 {
            return Err(Error::ConfigError(
                "CIC values are limited to 14 bits".to_string(),
            ));
        }
        if self.pri.window == 0 || self.pri.window >= 128 {
            return Err(Error::ConfigError(format!(
                "invalid transmit window {}",
                self.pri.window
            )));
        }
        for group in &self.nfas.groups {
            if group.spans.is_empty() {
                return Err(Error::ConfigError(format!(
                    "NFAS group {} has no spans",
                    group.group_id
                )));
            }
            for span in &group.spans {
                if !self.tdm.spans.iter().any(|s| s.span_id == *span) {
                    return Err(Error::ConfigError(format!(
                        "NFAS group {} references unknown span {}",
                        group.group_id, span
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        GatewayConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = GatewayConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.pri.t200_ms, 1000);
        assert_eq!(parsed.rtp.port_min, 10000);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let text = "[general]\nnode_id = \"gw1\"\nmax_calls = 10\n";
        let parsed: GatewayConfig = toml::from_str(text).unwrap();
        assert_eq!(parsed.general.node_id, "gw1");
        assert_eq!(parsed.pri.n200, 3);
        assert_eq!(parsed.nfas.replay_queue_depth, 64);
    }

    #[test]
    fn test_rejects_empty_nfas_group() {
        let mut config = GatewayConfig::default();
        config.nfas.groups.push(NfasGroupConfig {
            group_id: 1,
            spans: vec![],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_cic_above_14_bits() {
        let mut config = GatewayConfig::default();
        config.isup.cic_max = 0x4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_odd_rtp_base() {
        let mut config = GatewayConfig::default();
        config.rtp.port_min = 10001;
        assert!(config.validate().is_err());
    }
}
