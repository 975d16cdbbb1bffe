//! Server configuration
//!
//! Global settings plus a vhost-keyed table of per-stream options. A
//! connection resolves its [`VhostConfig`] once, right after the tcUrl is
//! discovered; unknown vhosts fall back to the default entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::*;
use crate::session::jitter::JitterAlgorithm;

/// Per-vhost options
#[derive(Debug, Clone)]
pub struct VhostConfig {
    /// Outbound chunk size pushed to clients after connect
    pub chunk_size: u32,

    /// Disable Nagle's algorithm on publish/play sockets
    pub tcp_nodelay: bool,

    /// Merged-read on the publishing path
    pub mr_enabled: bool,

    /// Merged-read batching interval
    pub mr_sleep: Duration,

    /// Merged-write batching interval on the play path
    pub mw_sleep: Duration,

    /// How long to wait for a publisher's first packet
    pub publish_first_pkt_timeout: Duration,

    /// How long to wait between a publisher's packets
    pub publish_normal_pkt_timeout: Duration,

    /// Cache the last group of pictures for late joiners
    pub gop_cache: bool,

    /// Per-consumer queue cap, in buffered AV duration
    pub queue_length: Duration,

    /// Timestamp rewriting policy on the play path
    pub jitter_algorithm: JitterAlgorithm,

    /// Absolute timecode: forward publisher timestamps unmodified
    pub atc: bool,

    /// Reorder badly interleaved AV by timestamp before fan-out
    pub mix_correct: bool,

    /// This vhost relays for an origin (admission differs)
    pub is_edge: bool,
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            chunk_size: OUT_CHUNK_SIZE,
            tcp_nodelay: false,
            mr_enabled: true,
            mr_sleep: Duration::from_millis(350),
            mw_sleep: Duration::from_millis(350),
            publish_first_pkt_timeout: Duration::from_secs(20),
            publish_normal_pkt_timeout: Duration::from_secs(5),
            gop_cache: true,
            queue_length: Duration::from_secs(30),
            jitter_algorithm: JitterAlgorithm::Full,
            atc: false,
            mix_correct: false,
            is_edge: false,
        }
    }
}

/// Server-wide configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Window acknowledgement size advertised after connect
    pub window_ack_size: u32,

    /// Peer bandwidth advertised after connect
    pub peer_bandwidth: u32,

    /// Deadline for handshake + connect
    pub connect_timeout: Duration,

    /// Fallback options for vhosts without an explicit entry
    pub default_vhost: VhostConfig,

    /// Explicit per-vhost overrides
    pub vhosts: HashMap<String, VhostConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1935".parse().expect("static bind addr"),
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            connect_timeout: CONNECT_TIMEOUT,
            default_vhost: VhostConfig::default(),
            vhosts: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Config with a custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Install options for one vhost
    pub fn vhost(mut self, name: impl Into<String>, config: VhostConfig) -> Self {
        self.vhosts.insert(name.into(), config);
        self
    }

    /// Replace the fallback vhost options
    pub fn default_vhost(mut self, config: VhostConfig) -> Self {
        self.default_vhost = config;
        self
    }

    /// Options for a vhost, falling back to the default entry
    pub fn vhost_config(&self, vhost: &str) -> &VhostConfig {
        self.vhosts.get(vhost).unwrap_or(&self.default_vhost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 1935);
        assert_eq!(config.window_ack_size, 2_500_000);
        assert_eq!(config.peer_bandwidth, 2_500_000);
        assert_eq!(config.default_vhost.chunk_size, 60000);
        assert_eq!(config.default_vhost.queue_length, Duration::from_secs(30));
        assert_eq!(config.default_vhost.jitter_algorithm, JitterAlgorithm::Full);
        assert!(config.default_vhost.gop_cache);
        assert!(!config.default_vhost.atc);
    }

    #[test]
    fn test_vhost_fallback() {
        let mut low_latency = VhostConfig::default();
        low_latency.gop_cache = false;
        low_latency.mw_sleep = Duration::from_millis(100);

        let config = ServerConfig::default().vhost("fast.example.com", low_latency);

        assert!(!config.vhost_config("fast.example.com").gop_cache);
        assert!(config.vhost_config("other.example.com").gop_cache);
    }
}
