use std::{
    fmt,
    fs::File,
    io::{self, BufReader},
    str::FromStr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use rustls::{
    RootCertStore,
    client::Resumption,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ServerSessionMemoryCache, StoresServerSessions},
};
use thiserror::Error;

use crate::{
    ConnectError, INITIAL_MTU, MAX_UDP_PAYLOAD, PROTOCOL_VERSION, VarInt,
    congestion::{self, bbr::BbrConfig, cubic::CubicConfig, new_reno::NewRenoConfig},
    crypto,
};

/// Number of server sessions remembered for resumption and 0-RTT
const SESSION_CACHE_SIZE: usize = 256;

/// Parameters governing every connection created from this configuration
///
/// A `Config` is built once and handed by reference to [`Connection::connect`] and
/// [`Connection::accept`]. The rustls configuration is built on first use and shared by every
/// connection created afterwards, so a client connecting to the same server twice can resume the
/// session and send 0-RTT data. Changing any TLS setting discards it.
///
/// Flow control limits default to zero as in RFC 9000, which forbids the peer from sending any
/// stream data; applications set them explicitly.
///
/// [`Connection::connect`]: crate::Connection::connect
/// [`Connection::accept`]: crate::Connection::accept
pub struct Config {
    pub(crate) version: u32,

    cert_chain: Vec<CertificateDer<'static>>,
    priv_key: Option<PrivateKeyDer<'static>>,
    roots: RootCertStore,
    verify_peer: Option<bool>,
    pub(crate) alpn_protocols: Vec<Vec<u8>>,
    pub(crate) early_data: bool,
    resumption: Resumption,
    server_sessions: Arc<dyn StoresServerSessions>,
    /// rustls only resumes sessions recorded under the same certificate verifier instance
    client_tls: OnceLock<Arc<rustls::ClientConfig>>,
    server_tls: OnceLock<Arc<rustls::ServerConfig>>,

    pub(crate) transport: TransportConfig,
}

impl Config {
    /// Create a configuration for the given QUIC version
    pub fn new(version: u32) -> Result<Self, ConfigError> {
        if version != PROTOCOL_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,

            cert_chain: Vec::new(),
            priv_key: None,
            roots: RootCertStore::empty(),
            verify_peer: None,
            alpn_protocols: Vec::new(),
            early_data: false,
            resumption: Resumption::in_memory_sessions(SESSION_CACHE_SIZE),
            server_sessions: ServerSessionMemoryCache::new(SESSION_CACHE_SIZE),
            client_tls: OnceLock::new(),
            server_tls: OnceLock::new(),

            transport: TransportConfig::default(),
        })
    }

    /// Load the certificate chain presented to peers from a PEM file
    pub fn load_cert_chain_from_pem_file(&mut self, path: &str) -> Result<(), ConfigError> {
        let mut reader = BufReader::new(File::open(path)?);
        let chain = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(ConfigError::NoCertificates);
        }
        self.tls_changed();
        self.cert_chain = chain;
        Ok(())
    }

    /// Load the private key matching the certificate chain from a PEM file
    pub fn load_priv_key_from_pem_file(&mut self, path: &str) -> Result<(), ConfigError> {
        let mut reader = BufReader::new(File::open(path)?);
        let key = rustls_pemfile::private_key(&mut reader)?.ok_or(ConfigError::NoPrivateKey)?;
        self.tls_changed();
        self.priv_key = Some(key);
        Ok(())
    }

    /// Trust the certificates found in a PEM file when verifying peers
    pub fn load_verify_locations_from_file(&mut self, path: &str) -> Result<(), ConfigError> {
        let mut reader = BufReader::new(File::open(path)?);
        self.tls_changed();
        for cert in rustls_pemfile::certs(&mut reader) {
            self.roots.add(cert?)?;
        }
        Ok(())
    }

    /// Set the DER-encoded certificate chain presented to peers
    pub fn set_cert_chain(&mut self, chain: Vec<CertificateDer<'static>>) {
        self.tls_changed();
        self.cert_chain = chain;
    }

    /// Set the DER-encoded private key matching the certificate chain
    pub fn set_priv_key(&mut self, key: PrivateKeyDer<'static>) {
        self.tls_changed();
        self.priv_key = Some(key);
    }

    /// Trust `cert` when verifying peers
    pub fn add_root_certificate(&mut self, cert: CertificateDer<'static>) -> Result<(), ConfigError> {
        self.tls_changed();
        self.roots.add(cert)?;
        Ok(())
    }

    /// Whether to verify the peer's certificate
    ///
    /// Clients verify servers by default; disabling it accepts any certificate.
    pub fn verify_peer(&mut self, verify: bool) {
        self.tls_changed();
        self.verify_peer = Some(verify);
    }

    /// Set the supported application protocols from their wire format
    ///
    /// `protos` is a sequence of length-prefixed protocol names, as produced by
    /// [`encode_alpn`](crate::encode_alpn).
    pub fn set_application_protos(&mut self, mut protos: &[u8]) -> Result<(), ConfigError> {
        let mut list = Vec::new();
        while let Some((&len, rest)) = protos.split_first() {
            let len = len as usize;
            if len == 0 || rest.len() < len {
                return Err(ConfigError::InvalidAlpn);
            }
            list.push(rest[..len].to_vec());
            protos = &rest[len..];
        }
        self.tls_changed();
        self.alpn_protocols = list;
        Ok(())
    }

    /// Set the supported application protocols in order of preference
    pub fn set_application_protos_list(&mut self, protos: &[&[u8]]) -> Result<(), ConfigError> {
        if protos.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(ConfigError::InvalidAlpn);
        }
        self.tls_changed();
        self.alpn_protocols = protos.iter().map(|p| p.to_vec()).collect();
        Ok(())
    }

    /// Maximum duration of inactivity in milliseconds, zero disables the timeout
    ///
    /// The effective timeout is the smaller of this and the peer's value.
    pub fn set_max_idle_timeout(&mut self, ms: u64) {
        self.transport.max_idle_timeout = Duration::from_millis(ms);
    }

    /// Largest UDP payload we are willing to receive
    pub fn set_max_recv_udp_payload_size(&mut self, size: usize) {
        self.transport.max_recv_udp_payload_size =
            size.clamp(INITIAL_MTU.into(), MAX_UDP_PAYLOAD.into()) as u16;
    }

    /// Largest UDP payload we will send, the ceiling for path MTU discovery
    pub fn set_max_send_udp_payload_size(&mut self, size: usize) {
        self.transport.max_send_udp_payload_size =
            size.clamp(INITIAL_MTU.into(), MAX_UDP_PAYLOAD.into()) as u16;
    }

    /// Connection-level flow control limit advertised to the peer
    pub fn set_initial_max_data(&mut self, v: u64) {
        self.transport.initial_max_data = VarInt::saturating(v);
    }

    /// Flow control limit for bidirectional streams we open
    pub fn set_initial_max_stream_data_bidi_local(&mut self, v: u64) {
        self.transport.initial_max_stream_data_bidi_local = VarInt::saturating(v);
    }

    /// Flow control limit for bidirectional streams the peer opens
    pub fn set_initial_max_stream_data_bidi_remote(&mut self, v: u64) {
        self.transport.initial_max_stream_data_bidi_remote = VarInt::saturating(v);
    }

    /// Flow control limit for unidirectional streams the peer opens
    pub fn set_initial_max_stream_data_uni(&mut self, v: u64) {
        self.transport.initial_max_stream_data_uni = VarInt::saturating(v);
    }

    /// Number of concurrent bidirectional streams the peer may open
    pub fn set_initial_max_streams_bidi(&mut self, v: u64) {
        self.transport.initial_max_streams_bidi =
            VarInt::saturating(v.min(crate::MAX_STREAM_COUNT));
    }

    /// Number of concurrent unidirectional streams the peer may open
    pub fn set_initial_max_streams_uni(&mut self, v: u64) {
        self.transport.initial_max_streams_uni =
            VarInt::saturating(v.min(crate::MAX_STREAM_COUNT));
    }

    /// Exponent applied to the ACK delay we report, at most 20
    pub fn set_ack_delay_exponent(&mut self, v: u64) {
        self.transport.ack_delay_exponent = v.min(20) as u8;
    }

    /// Longest we will delay an acknowledgement, in milliseconds
    pub fn set_max_ack_delay(&mut self, ms: u64) {
        self.transport.max_ack_delay = Duration::from_millis(ms.min((1 << 14) - 1));
    }

    /// Number of peer connection IDs we are willing to store, at least 2
    pub fn set_active_connection_id_limit(&mut self, v: u64) {
        self.transport.active_connection_id_limit = v.max(2);
    }

    /// Forbid clients from migrating to a new address (servers only)
    pub fn set_disable_active_migration(&mut self, v: bool) {
        self.transport.disable_active_migration = v;
    }

    /// Whether to send reserved values that exercise the peer's extensibility handling
    pub fn grease(&mut self, v: bool) {
        self.transport.grease = v;
    }

    /// Allow 0-RTT data on resumed sessions
    pub fn enable_early_data(&mut self) {
        self.tls_changed();
        self.early_data = true;
    }

    /// RTT assumed before any sample is taken
    pub fn set_initial_rtt(&mut self, rtt: Duration) {
        self.transport.initial_rtt = rtt;
    }

    /// Whether to use HyStart++ to leave slow start before a loss occurs
    pub fn enable_hystart(&mut self, v: bool) {
        self.transport.hystart = v;
    }

    /// Whether to pace outgoing packets over the round trip
    pub fn enable_pacing(&mut self, v: bool) {
        self.transport.pacing = v;
    }

    /// Upper bound on the pacing rate in bytes per second
    pub fn set_max_pacing_rate(&mut self, rate: u64) {
        self.transport.max_pacing_rate = Some(rate);
    }

    /// Congestion control algorithm used by new connections
    pub fn set_cc_algorithm(&mut self, algo: CongestionControlAlgorithm) {
        self.transport.cc_algorithm = algo;
    }

    /// Select the congestion control algorithm by name
    pub fn set_cc_algorithm_name(&mut self, name: &str) -> Result<(), ConfigError> {
        self.transport.cc_algorithm = name.parse()?;
        Ok(())
    }

    /// Period of inactivity after which a PING is sent to keep the connection alive
    pub fn set_keep_alive_interval(&mut self, interval: Option<Duration>) {
        self.transport.keep_alive_interval = interval;
    }

    /// Enable unreliable datagrams with the given queue capacities
    pub fn enable_dgram(&mut self, enabled: bool, recv_queue_len: usize, send_queue_len: usize) {
        self.transport.dgram_enabled = enabled;
        self.transport.dgram_recv_queue_len = recv_queue_len;
        self.transport.dgram_send_queue_len = send_queue_len;
    }

    /// What [`Connection::dgram_send`](crate::Connection::dgram_send) does when the send queue
    /// is full
    pub fn set_dgram_full_policy(&mut self, policy: DatagramFullPolicy) {
        self.transport.dgram_full_policy = policy;
    }

    /// Whether to probe for a path MTU above the initial 1200 bytes
    pub fn discover_pmtu(&mut self, v: bool) {
        self.transport.discover_pmtu = v;
    }

    /// Maximum number of bytes buffered for transmission across all streams
    pub fn set_send_window(&mut self, v: u64) {
        self.transport.send_window = v;
    }

    fn tls_changed(&mut self) {
        self.client_tls.take();
        self.server_tls.take();
    }

    pub(crate) fn client_tls(&self) -> Result<Arc<rustls::ClientConfig>, ConnectError> {
        if let Some(config) = self.client_tls.get() {
            return Ok(config.clone());
        }
        let roots = self.verify_peer.unwrap_or(true).then(|| self.roots.clone());
        let config = crypto::rustls::client_config(
            roots,
            self.alpn_protocols.clone(),
            self.early_data,
            self.resumption.clone(),
        )?;
        Ok(self.client_tls.get_or_init(|| Arc::new(config)).clone())
    }

    pub(crate) fn server_tls(&self) -> Result<Arc<rustls::ServerConfig>, ConnectError> {
        if let Some(config) = self.server_tls.get() {
            return Ok(config.clone());
        }
        if self.cert_chain.is_empty() {
            return Err(ConnectError::MissingTlsConfig("certificate chain"));
        }
        let key = self
            .priv_key
            .as_ref()
            .ok_or(ConnectError::MissingTlsConfig("private key"))?;
        let config = crypto::rustls::server_config(
            self.cert_chain.clone(),
            key.clone_key(),
            self.alpn_protocols.clone(),
            self.early_data,
            self.server_sessions.clone(),
        )?;
        Ok(self.server_tls.get_or_init(|| Arc::new(config)).clone())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("version", &self.version)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("early_data", &self.early_data)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Transport settings copied into every connection created from a [`Config`]
#[derive(Debug, Clone)]
pub(crate) struct TransportConfig {
    pub(crate) max_idle_timeout: Duration,
    pub(crate) max_recv_udp_payload_size: u16,
    pub(crate) max_send_udp_payload_size: u16,
    pub(crate) initial_max_data: VarInt,
    pub(crate) initial_max_stream_data_bidi_local: VarInt,
    pub(crate) initial_max_stream_data_bidi_remote: VarInt,
    pub(crate) initial_max_stream_data_uni: VarInt,
    pub(crate) initial_max_streams_bidi: VarInt,
    pub(crate) initial_max_streams_uni: VarInt,
    pub(crate) ack_delay_exponent: u8,
    pub(crate) max_ack_delay: Duration,
    pub(crate) active_connection_id_limit: u64,
    pub(crate) disable_active_migration: bool,
    pub(crate) grease: bool,
    pub(crate) send_window: u64,

    pub(crate) initial_rtt: Duration,
    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold: f32,
    pub(crate) persistent_congestion_threshold: u32,
    pub(crate) keep_alive_interval: Option<Duration>,
    pub(crate) crypto_buffer_size: usize,

    pub(crate) cc_algorithm: CongestionControlAlgorithm,
    pub(crate) hystart: bool,
    pub(crate) pacing: bool,
    pub(crate) max_pacing_rate: Option<u64>,
    pub(crate) discover_pmtu: bool,

    pub(crate) dgram_enabled: bool,
    pub(crate) dgram_recv_queue_len: usize,
    pub(crate) dgram_send_queue_len: usize,
    pub(crate) dgram_full_policy: DatagramFullPolicy,
}

impl TransportConfig {
    pub(crate) fn congestion_controller(
        &self,
        now: std::time::Instant,
        current_mtu: u16,
    ) -> Box<dyn congestion::Controller> {
        match self.cc_algorithm {
            CongestionControlAlgorithm::Reno => {
                let mut config = NewRenoConfig::default();
                config.hystart(self.hystart);
                Box::new(congestion::NewReno::new(Arc::new(config), now, current_mtu))
            }
            CongestionControlAlgorithm::Cubic => {
                let mut config = CubicConfig::default();
                config.hystart(self.hystart);
                Box::new(congestion::Cubic::new(Arc::new(config), now, current_mtu))
            }
            CongestionControlAlgorithm::Bbr => {
                Box::new(congestion::Bbr::new(Arc::new(BbrConfig::default()), current_mtu))
            }
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::ZERO,
            max_recv_udp_payload_size: MAX_UDP_PAYLOAD,
            max_send_udp_payload_size: INITIAL_MTU,
            initial_max_data: VarInt(0),
            initial_max_stream_data_bidi_local: VarInt(0),
            initial_max_stream_data_bidi_remote: VarInt(0),
            initial_max_stream_data_uni: VarInt(0),
            initial_max_streams_bidi: VarInt(0),
            initial_max_streams_uni: VarInt(0),
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            active_connection_id_limit: 2,
            disable_active_migration: false,
            grease: true,
            send_window: 8 * 1024 * 1024,

            initial_rtt: Duration::from_millis(333),
            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            persistent_congestion_threshold: 3,
            keep_alive_interval: None,
            crypto_buffer_size: 16 * 1024,

            cc_algorithm: CongestionControlAlgorithm::Cubic,
            hystart: true,
            pacing: true,
            max_pacing_rate: None,
            discover_pmtu: false,

            dgram_enabled: false,
            dgram_recv_queue_len: 0,
            dgram_send_queue_len: 0,
            dgram_full_policy: DatagramFullPolicy::DropOldest,
        }
    }
}

/// Available congestion control algorithms
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CongestionControlAlgorithm {
    /// NewReno, RFC 9002 section 7
    Reno,
    /// CUBIC, RFC 9438
    Cubic,
    /// BBR, model-based control driven by delivery rate and minimum RTT
    Bbr,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, ConfigError> {
        match name {
            "reno" => Ok(Self::Reno),
            "cubic" => Ok(Self::Cubic),
            "bbr" => Ok(Self::Bbr),
            _ => Err(ConfigError::UnknownCongestionControl(name.into())),
        }
    }
}

/// How a full datagram send queue treats a new datagram
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum DatagramFullPolicy {
    /// Discard the oldest queued datagram to make room
    #[default]
    DropOldest,
    /// Refuse the new datagram with [`SendDatagramError::QueueFull`](crate::SendDatagramError)
    Reject,
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Only QUIC version 1 is implemented
    #[error("unsupported QUIC version {0:#x}")]
    UnsupportedVersion(u32),
    /// Reading a PEM file failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A PEM file held no certificates
    #[error("no certificates found")]
    NoCertificates,
    /// A PEM file held no private key
    #[error("no private key found")]
    NoPrivateKey,
    /// A root certificate could not be parsed
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// Application protocols were malformed
    #[error("invalid application protocol list")]
    InvalidAlpn,
    /// The named congestion control algorithm does not exist
    #[error("unknown congestion control algorithm {0:?}")]
    UnknownCongestionControl(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn rejects_unknown_version() {
        assert_matches!(
            Config::new(0xbaba_baba),
            Err(ConfigError::UnsupportedVersion(0xbaba_baba))
        );
    }

    #[test]
    fn alpn_wire_format() {
        let mut config = Config::new(PROTOCOL_VERSION).unwrap();
        config
            .set_application_protos(&crate::encode_alpn(&["h3", "echo"]))
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec(), b"echo".to_vec()]);
        assert_matches!(
            config.set_application_protos(b"\x05echo"),
            Err(ConfigError::InvalidAlpn)
        );
        assert_matches!(
            config.set_application_protos_list(&[b""]),
            Err(ConfigError::InvalidAlpn)
        );
    }

    #[test]
    fn tls_config_shared_until_changed() {
        let mut config = Config::new(PROTOCOL_VERSION).unwrap();
        config.verify_peer(false);
        let first = config.client_tls().unwrap();
        let second = config.client_tls().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        config.enable_early_data();
        let rebuilt = config.client_tls().unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert!(rebuilt.enable_early_data);
    }

    #[test]
    fn cc_algorithm_names() {
        let mut config = Config::new(PROTOCOL_VERSION).unwrap();
        assert_eq!(config.transport.cc_algorithm, CongestionControlAlgorithm::Cubic);
        config.set_cc_algorithm_name("bbr").unwrap();
        assert_eq!(config.transport.cc_algorithm, CongestionControlAlgorithm::Bbr);
        config.set_cc_algorithm_name("reno").unwrap();
        assert_eq!(config.transport.cc_algorithm, CongestionControlAlgorithm::Reno);
        assert_matches!(
            config.set_cc_algorithm_name("vegas"),
            Err(ConfigError::UnknownCongestionControl(_))
        );
    }

    #[test]
    fn server_requires_certificate() {
        let config = Config::new(PROTOCOL_VERSION).unwrap();
        assert_matches!(
            config.server_tls(),
            Err(ConnectError::MissingTlsConfig("certificate chain"))
        );
        assert!(config.client_tls().is_ok());
    }

    #[test]
    fn payload_sizes_clamped() {
        let mut config = Config::new(PROTOCOL_VERSION).unwrap();
        config.set_max_send_udp_payload_size(100);
        assert_eq!(config.transport.max_send_udp_payload_size, INITIAL_MTU);
        config.set_max_recv_udp_payload_size(100_000);
        assert_eq!(config.transport.max_recv_udp_payload_size, MAX_UDP_PAYLOAD);
    }
}
