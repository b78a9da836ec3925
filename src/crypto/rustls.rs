use std::{io, sync::Arc};

use bytes::BytesMut;
use ring::aead;
use rustls::{
    self, DigitallySignedStruct, HandshakeKind, RootCertStore, SignatureScheme,
    client::{
        Resumption,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    quic::{Connection, HeaderProtectionKey, KeyChange, PacketKey, Secrets, Suite, Version},
    server::StoresServerSessions,
};

use crate::{
    ConnectError, ConnectionId, Side, TransportError, TransportErrorCode,
    crypto::{self, CryptoError, HeaderKey, KeyPair, Keys},
    transport_parameters::TransportParameters,
};

impl From<Side> for rustls::Side {
    fn from(s: Side) -> Self {
        match s {
            Side::Client => Self::Client,
            Side::Server => Self::Server,
        }
    }
}

/// A rustls TLS session
pub(crate) struct TlsSession {
    got_alpn: bool,
    next_secrets: Option<Secrets>,
    inner: Connection,
    suite: Suite,
}

impl TlsSession {
    pub(crate) fn new_client(
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
        params: &TransportParameters,
    ) -> Result<Self, ConnectError> {
        let suite = initial_suite(config.crypto_provider());
        let name = ServerName::try_from(server_name)
            .map_err(|_| ConnectError::InvalidServerName(server_name.into()))?
            .to_owned();
        let inner =
            rustls::quic::ClientConnection::new(config, Version::V1, name, to_vec(params))?;
        Ok(Self {
            got_alpn: false,
            next_secrets: None,
            inner: Connection::Client(inner),
            suite,
        })
    }

    pub(crate) fn new_server(
        config: Arc<rustls::ServerConfig>,
        params: &TransportParameters,
    ) -> Result<Self, ConnectError> {
        let suite = initial_suite(config.crypto_provider());
        let inner = rustls::quic::ServerConnection::new(config, Version::V1, to_vec(params))?;
        Ok(Self {
            got_alpn: false,
            next_secrets: None,
            inner: Connection::Server(inner),
            suite,
        })
    }

    fn side(&self) -> Side {
        match self.inner {
            Connection::Client(_) => Side::Client,
            Connection::Server(_) => Side::Server,
        }
    }
}

impl crypto::Session for TlsSession {
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys {
        initial_keys(dst_cid, side, &self.suite)
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.inner.alpn_protocol()
    }

    fn early_crypto(&self) -> Option<(Box<dyn HeaderKey>, Box<dyn crypto::PacketKey>)> {
        let keys = self.inner.zero_rtt_keys()?;
        Some((Box::new(keys.header), Box::new(keys.packet)))
    }

    fn early_data_accepted(&self) -> Option<bool> {
        match self.inner {
            Connection::Client(ref session) => Some(session.is_early_data_accepted()),
            _ => None,
        }
    }

    fn is_handshaking(&self) -> bool {
        self.inner.is_handshaking()
    }

    fn is_resumed(&self) -> bool {
        self.inner.handshake_kind() == Some(HandshakeKind::Resumed)
    }

    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError> {
        self.inner.read_hs(buf).map_err(|e| {
            if let Some(alert) = self.inner.alert() {
                TransportError {
                    code: TransportErrorCode::crypto(alert.into()),
                    frame: None,
                    reason: e.to_string(),
                }
            } else {
                TransportError::PROTOCOL_VIOLATION(format!("TLS error: {e}"))
            }
        })?;
        if !self.got_alpn && (self.inner.alpn_protocol().is_some() || !self.is_handshaking()) {
            self.got_alpn = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError> {
        match self.inner.quic_transport_parameters() {
            None => Ok(None),
            Some(buf) => TransportParameters::read(self.side(), &mut io::Cursor::new(buf))
                .map(Some)
                .map_err(Into::into),
        }
    }

    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys> {
        match self.inner.write_hs(buf)? {
            KeyChange::Handshake { keys } => Some(boxed_keys(keys)),
            KeyChange::OneRtt { keys, next } => {
                self.next_secrets = Some(next);
                Some(boxed_keys(keys))
            }
        }
    }

    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn crypto::PacketKey>>> {
        let secrets = self.next_secrets.as_mut()?;
        let keys = secrets.next_packet_keys();
        Some(KeyPair {
            local: Box::new(keys.local),
            remote: Box::new(keys.remote),
        })
    }

    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool {
        is_valid_retry(orig_dst_cid, header, payload)
    }
}

const RETRY_INTEGRITY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8, 0x4e,
];
const RETRY_INTEGRITY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

fn retry_integrity_key() -> aead::LessSafeKey {
    aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY_V1)
            .expect("retry integrity key has the AES-128 key length"),
    )
}

/// Length of the integrity tag closing every Retry packet
const RETRY_TAG_LEN: usize = 16;

/// The Retry pseudo-packet of RFC 9001 §5.8: the original destination CID, length-prefixed,
/// followed by the Retry packet itself
fn retry_pseudo_packet(orig_dst_cid: &ConnectionId, parts: &[&[u8]]) -> Vec<u8> {
    let len = 1 + orig_dst_cid.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut pseudo = Vec::with_capacity(len);
    pseudo.push(orig_dst_cid.len() as u8);
    pseudo.extend_from_slice(orig_dst_cid);
    for part in parts {
        pseudo.extend_from_slice(part);
    }
    pseudo
}

fn retry_nonce() -> aead::Nonce {
    aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE_V1)
}

/// Integrity tag of a Retry packet sent in response to an Initial addressed to `orig_dst_cid`
pub(crate) fn retry_tag(orig_dst_cid: &ConnectionId, packet: &[u8]) -> [u8; RETRY_TAG_LEN] {
    let aad = retry_pseudo_packet(orig_dst_cid, &[packet]);
    let tag = retry_integrity_key()
        .seal_in_place_separate_tag(retry_nonce(), aead::Aad::from(aad), &mut [])
        .expect("empty plaintext is within AES-GCM limits");
    let mut out = [0; RETRY_TAG_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Check the integrity tag at the end of a Retry packet's `payload`
pub(crate) fn is_valid_retry(orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool {
    if payload.len() < RETRY_TAG_LEN {
        return false;
    }
    let mut pseudo = retry_pseudo_packet(orig_dst_cid, &[header, payload]);
    let tag_start = pseudo.len() - RETRY_TAG_LEN;
    let (aad, tag) = pseudo.split_at_mut(tag_start);
    retry_integrity_key()
        .open_in_place(retry_nonce(), aead::Aad::from(aad), tag)
        .is_ok()
}

/// Split `packet` into the header protection sample, the first byte and the packet number
///
/// The sample starts four bytes past `pn_offset` whatever the actual packet number length.
fn protected_parts(
    pn_offset: usize,
    sample_len: usize,
    packet: &mut [u8],
) -> (&[u8], &mut u8, &mut [u8]) {
    let (header, sample) = packet.split_at_mut(pn_offset + 4);
    let (first, after_first) = header.split_at_mut(1);
    let pn = &mut after_first[pn_offset - 1..];
    (&sample[..sample_len], &mut first[0], pn)
}

impl crypto::HeaderKey for Box<dyn HeaderProtectionKey> {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (sample, first, pn) = protected_parts(pn_offset, self.sample_len(), packet);
        self.decrypt_in_place(sample, first, pn)
            .expect("sample length checked by caller");
    }

    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) {
        let (sample, first, pn) = protected_parts(pn_offset, self.sample_len(), packet);
        self.encrypt_in_place(sample, first, pn)
            .expect("sample length checked by caller");
    }

    fn sample_size(&self) -> usize {
        self.sample_len()
    }
}

impl crypto::PacketKey for Box<dyn PacketKey> {
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize) {
        let (header, payload_tag) = buf.split_at_mut(header_len);
        let (payload, tag_storage) = payload_tag.split_at_mut(payload_tag.len() - self.tag_len());
        let tag = self
            .encrypt_in_place(packet, &*header, payload)
            .expect("packet sizes are within AEAD limits");
        tag_storage.copy_from_slice(tag.as_ref());
    }

    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        let plain = self
            .decrypt_in_place(packet, header, payload.as_mut())
            .map_err(|_| CryptoError)?;
        let plain_len = plain.len();
        payload.truncate(plain_len);
        Ok(())
    }

    fn tag_len(&self) -> usize {
        (**self).tag_len()
    }

    fn confidentiality_limit(&self) -> u64 {
        (**self).confidentiality_limit()
    }

    fn integrity_limit(&self) -> u64 {
        (**self).integrity_limit()
    }
}

/// TLS 1.3 client configuration for one connection
///
/// Certificates are checked against `roots` unless it is `None`, in which case any certificate
/// is accepted. `resumption` is shared between connections so tickets from one can be used for
/// 0-RTT by the next.
pub(crate) fn client_config(
    roots: Option<RootCertStore>,
    alpn_protocols: Vec<Vec<u8>>,
    early_data: bool,
    resumption: Resumption,
) -> Result<rustls::ClientConfig, rustls::Error> {
    let provider = configured_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?;
    let mut config = match roots {
        Some(roots) => builder.with_root_certificates(roots).with_no_client_auth(),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth(),
    };
    config.alpn_protocols = alpn_protocols;
    config.enable_early_data = early_data;
    config.resumption = resumption;
    Ok(config)
}

/// TLS 1.3 server configuration for one connection
///
/// QUIC only permits `max_early_data_size` of 0 or `u32::MAX`.
pub(crate) fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn_protocols: Vec<Vec<u8>>,
    early_data: bool,
    session_storage: Arc<dyn StoresServerSessions>,
) -> Result<rustls::ServerConfig, rustls::Error> {
    let mut config = rustls::ServerConfig::builder_with_provider(configured_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    config.alpn_protocols = alpn_protocols;
    config.max_early_data_size = if early_data { u32::MAX } else { 0 };
    config.session_storage = session_storage;
    Ok(config)
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn initial_suite(provider: &Arc<CryptoProvider>) -> Suite {
    // The *ring* provider always carries TLS13_AES_128_GCM_SHA256
    initial_suite_from_provider(provider).expect("no initial cipher suite found")
}

pub(crate) fn initial_suite_from_provider(provider: &Arc<CryptoProvider>) -> Option<Suite> {
    provider
        .cipher_suites
        .iter()
        .find_map(|cs| match (cs.suite(), cs.tls13()) {
            (rustls::CipherSuite::TLS13_AES_128_GCM_SHA256, Some(suite)) => {
                Some(suite.quic_suite())
            }
            _ => None,
        })
        .flatten()
}

pub(crate) fn configured_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn to_vec(params: &TransportParameters) -> Vec<u8> {
    let mut bytes = Vec::new();
    params.write(&mut bytes);
    bytes
}

/// Keys protecting Initial packets of a connection whose client first addressed `dst_cid`
pub(crate) fn initial_keys(dst_cid: &ConnectionId, side: Side, suite: &Suite) -> Keys {
    boxed_keys(suite.keys(dst_cid, side.into(), Version::V1))
}

fn boxed_keys(keys: rustls::quic::Keys) -> Keys {
    Keys {
        header: KeyPair {
            local: Box::new(keys.local.header),
            remote: Box::new(keys.remote.header),
        },
        packet: KeyPair {
            local: Box::new(keys.local.packet),
            remote: Box::new(keys.remote.packet),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn retry_tag_roundtrip() {
        let odcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let mut packet = hex!("ff000000010008f067a5502a4262b5746f6b656e").to_vec();
        let tag = retry_tag(&odcid, &packet);
        packet.extend_from_slice(&tag);
        let (header, payload) = packet.split_at(9 + 8);
        assert!(is_valid_retry(&odcid, header, payload));
        let other = ConnectionId::new(&hex!("0000000000000000"));
        assert!(!is_valid_retry(&other, header, payload));
        assert!(!is_valid_retry(&odcid, header, &payload[..10]));
    }

    #[test]
    fn initial_keys_are_symmetric() {
        let suite = initial_suite(&configured_provider());
        let dcid = ConnectionId::new(&hex!("8394c8f03e515708"));
        let client = initial_keys(&dcid, Side::Client, &suite);
        let server = initial_keys(&dcid, Side::Server, &suite);

        let header = [0xc3u8, 0, 0, 0, 1];
        let mut buf = header.to_vec();
        buf.extend_from_slice(b"client hello");
        buf.resize(buf.len() + client.packet.local.tag_len(), 0);
        client.packet.local.encrypt(2, &mut buf, header.len());

        let mut payload = BytesMut::from(&buf[header.len()..]);
        server
            .packet
            .remote
            .decrypt(2, &header, &mut payload)
            .unwrap();
        assert_eq!(&payload[..], b"client hello");
    }
}
