use std::{
    collections::VecDeque,
    io::{self, Write},
    net::{Ipv6Addr, SocketAddr},
    str,
    sync::LazyLock,
    time::{Duration, Instant},
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

use super::*;

/// Length of the connection IDs both sides pick for themselves
pub(crate) const CID_LEN: usize = 8;
/// Size of the buffer each side is polled with, the datagram budget of a typical driver
pub(crate) const DATAGRAM_BUDGET: usize = 1350;
/// Idle timeout of the default test configurations, in milliseconds
pub(crate) const IDLE_TIMEOUT_MS: u64 = 30_000;
/// Pending deadlines further away than this don't keep [`Pair::drive`] going
const IDLE_HORIZON: Duration = Duration::from_secs(10);
/// Guards against a pair that never settles
const MAX_STEPS: usize = 10_000;

/// A datagram in flight between the two sides
struct InFlight {
    arrival: Instant,
    info: RecvInfo,
    data: Vec<u8>,
}

/// A client and a server connection exchanging datagrams over a simulated network
///
/// Time only moves when [`Pair::step`] runs out of datagrams to deliver, jumping straight to the
/// next timer or arrival.
pub(crate) struct Pair {
    pub(crate) client: Connection,
    server: Option<Connection>,
    server_config: Config,
    pub(crate) client_addr: SocketAddr,
    pub(crate) server_addr: SocketAddr,
    pub(crate) time: Instant,
    /// One-way
    pub(crate) latency: Duration,
    /// Datagrams larger than this are dropped in both directions
    pub(crate) mtu: usize,
    /// Size of the buffers handed to `send`
    pub(crate) buf_size: usize,
    /// Answer the client's first Initial with a Retry
    pub(crate) retry: bool,
    /// Drop everything the server sends
    pub(crate) drop_server: bool,
    /// Number of upcoming client datagrams to drop
    pub(crate) drop_to_server: usize,
    /// Address a NAT in front of the client rewrites its source address to
    pub(crate) nat: Option<SocketAddr>,
    /// Client address whose datagrams never reach the server
    pub(crate) unreachable: Option<SocketAddr>,
    to_server: VecDeque<InFlight>,
    to_client: VecDeque<InFlight>,
    /// Where each datagram the client sent was addressed
    pub(crate) client_sent: Vec<SendInfo>,
    pub(crate) client_error: Option<ConnectionError>,
    pub(crate) server_error: Option<ConnectionError>,
}

impl Pair {
    pub(crate) fn new(client_config: &Config, server_config: Config) -> Self {
        Self::with_retry(client_config, server_config, false)
    }

    pub(crate) fn default_pair() -> Self {
        Self::new(&client_config(), server_config())
    }

    pub(crate) fn with_retry(client_config: &Config, server_config: Config, retry: bool) -> Self {
        let time = Instant::now();
        let client_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 44433);
        let server_addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);
        let client = Connection::connect(
            Some("localhost"),
            &generate_cid(CID_LEN),
            client_addr,
            server_addr,
            client_config,
            time,
        )
        .unwrap();
        Self {
            client,
            server: None,
            server_config,
            client_addr,
            server_addr,
            time,
            latency: Duration::ZERO,
            mtu: 1500,
            buf_size: DATAGRAM_BUDGET,
            retry,
            drop_server: false,
            drop_to_server: 0,
            nat: None,
            unreachable: None,
            to_server: VecDeque::new(),
            to_client: VecDeque::new(),
            client_sent: Vec::new(),
            client_error: None,
            server_error: None,
        }
    }

    /// Replace the client with a fresh connection to the same server
    ///
    /// The server side is forgotten, but its configuration and with it the session cache is
    /// kept, so the new connection can resume the old one's session.
    pub(crate) fn reconnect(&mut self, client_config: &Config) {
        self.client = Connection::connect(
            Some("localhost"),
            &generate_cid(CID_LEN),
            self.client_addr,
            self.server_addr,
            client_config,
            self.time,
        )
        .unwrap();
        self.server = None;
        self.to_server.clear();
        self.to_client.clear();
        self.client_sent.clear();
        self.client_error = None;
        self.server_error = None;
    }

    /// The server connection, created when the client's first Initial arrived
    pub(crate) fn server(&mut self) -> &mut Connection {
        self.server.as_mut().expect("server connection not accepted yet")
    }

    /// Drive both sides until the handshake completes
    pub(crate) fn connect(&mut self) {
        info!("connecting");
        for _ in 0..MAX_STEPS {
            if self.client.is_established() && self.server.as_ref().is_some_and(|s| s.is_established()) {
                return;
            }
            if !self.step() {
                break;
            }
        }
        panic!("handshake did not complete");
    }

    /// Exchange datagrams until both sides only wait for distant timers
    pub(crate) fn drive(&mut self) {
        for _ in 0..MAX_STEPS {
            if !self.step() {
                return;
            }
        }
        panic!("connections never settled");
    }

    /// Returns whether anything is left to do in the near future
    pub(crate) fn step(&mut self) -> bool {
        let sent = self.drive_client() + self.drive_server();
        if sent > 0 {
            return true;
        }

        let next = [
            self.client.timeout_instant(),
            self.server.as_ref().and_then(|s| s.timeout_instant()),
            self.to_server.front().map(|x| x.arrival),
            self.to_client.front().map(|x| x.arrival),
        ]
        .into_iter()
        .flatten()
        .min();
        match next {
            Some(t) if t < self.time + IDLE_HORIZON => {
                if t > self.time {
                    trace!(advance = ?(t - self.time), "advancing time");
                    self.time = t;
                }
                true
            }
            _ => false,
        }
    }

    /// Deliver due datagrams to the client and collect its output
    ///
    /// Returns the number of datagrams the client sent.
    pub(crate) fn drive_client(&mut self) -> usize {
        let _span = tracing::info_span!("client").entered();
        let now = self.time;
        if self.client.timeout_instant().is_some_and(|t| t <= now) {
            self.client.on_timeout(now);
        }
        while self.to_client.front().is_some_and(|x| x.arrival <= now) {
            let Some(mut datagram) = self.to_client.pop_front() else {
                break;
            };
            if let Err(error) = self.client.recv(&mut datagram.data, datagram.info, now) {
                self.client_error.get_or_insert(error);
            }
        }

        let mut count = 0;
        let mut buf = vec![0; self.buf_size];
        while let Some((len, info)) = self.client.send(&mut buf, now).unwrap() {
            count += 1;
            self.client_sent.push(info);
            self.route_to_server(info, buf[..len].to_vec());
        }
        count
    }

    /// Deliver due datagrams to the server, accepting the connection first if needed
    pub(crate) fn drive_server(&mut self) -> usize {
        let _span = tracing::info_span!("server").entered();
        let now = self.time;
        if let Some(server) = self.server.as_mut() {
            if server.timeout_instant().is_some_and(|t| t <= now) {
                server.on_timeout(now);
            }
        }
        while self.to_server.front().is_some_and(|x| x.arrival <= now) {
            let Some(mut datagram) = self.to_server.pop_front() else {
                break;
            };
            if self.server.is_none() && !self.accept(&datagram) {
                continue;
            }
            let server = self.server.as_mut().unwrap();
            if let Err(error) = server.recv(&mut datagram.data, datagram.info, now) {
                self.server_error.get_or_insert(error);
            }
        }

        let Some(server) = self.server.as_mut() else {
            return 0;
        };
        let mut count = 0;
        let mut buf = vec![0; self.buf_size];
        let mut out = Vec::new();
        while let Some((len, info)) = server.send(&mut buf, now).unwrap() {
            count += 1;
            out.push((info, buf[..len].to_vec()));
        }
        for (info, data) in out {
            if !self.drop_server {
                self.route_to_client(info, data);
            }
        }
        count
    }

    /// Play the driver's part for a datagram aimed at a server with no connection yet
    ///
    /// Returns whether a connection was accepted to process it.
    fn accept(&mut self, datagram: &InFlight) -> bool {
        let header = match parse_header(&datagram.data, CID_LEN) {
            Ok(header) => header,
            Err(error) => {
                trace!(%error, "driver dropping malformed datagram");
                return false;
            }
        };
        if header.ty != PacketType::Initial {
            return false;
        }
        let token = header.token.unwrap_or_default();
        let (scid, odcid) = match (self.retry, token.is_empty()) {
            (true, true) => {
                // Stateless Retry; the token simply carries the original destination CID
                let new_scid = generate_cid(CID_LEN);
                let mut out = [0; 256];
                let len = crate::retry(
                    &header.scid,
                    &header.dcid,
                    &new_scid,
                    &header.dcid,
                    header.version,
                    &mut out,
                )
                .unwrap();
                let info = SendInfo {
                    from: datagram.info.to,
                    to: datagram.info.from,
                    at: self.time,
                };
                self.route_to_client(info, out[..len].to_vec());
                return false;
            }
            (true, false) => (header.dcid, Some(ConnectionId::new(&token))),
            (false, _) => (generate_cid(CID_LEN), None),
        };
        let server = Connection::accept(
            &scid,
            odcid.as_ref(),
            datagram.info.to,
            datagram.info.from,
            &self.server_config,
            self.time,
        )
        .unwrap();
        self.server = Some(server);
        true
    }

    fn route_to_server(&mut self, info: SendInfo, data: Vec<u8>) {
        if data.len() > self.mtu {
            trace!(len = data.len(), "link dropping oversized datagram");
            return;
        }
        if info.to != self.server_addr {
            trace!(to = %info.to, "no server at destination");
            return;
        }
        if self.unreachable == Some(info.from) {
            trace!(from = %info.from, "no route from source");
            return;
        }
        if self.drop_to_server > 0 {
            trace!(len = data.len(), "link dropping datagram");
            self.drop_to_server -= 1;
            return;
        }
        self.to_server.push_back(InFlight {
            arrival: info.at.max(self.time) + self.latency,
            info: RecvInfo {
                from: self.nat.unwrap_or(info.from),
                to: info.to,
            },
            data,
        });
    }

    fn route_to_client(&mut self, info: SendInfo, data: Vec<u8>) {
        if data.len() > self.mtu {
            trace!(len = data.len(), "link dropping oversized datagram");
            return;
        }
        let to = match self.nat {
            Some(nat) if nat == info.to => self.client_addr,
            _ => info.to,
        };
        self.to_client.push_back(InFlight {
            arrival: info.at.max(self.time) + self.latency,
            info: RecvInfo {
                from: info.from,
                to,
            },
            data,
        });
    }

    /// Hand a crafted datagram to the client as if the server had sent it
    pub(crate) fn inject_to_client(&mut self, data: Vec<u8>) {
        let info = SendInfo {
            from: self.server_addr,
            to: self.client_addr,
            at: self.time,
        };
        self.route_to_client(info, data);
    }

    /// Send `data` with FIN from the client on `id` and drive until the server got it all
    pub(crate) fn client_send_all(&mut self, id: StreamId, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            match self.client.stream_send(id, &data[offset..], true) {
                Ok(n) => offset += n,
                Err(WriteError::Blocked) => {}
                Err(e) => panic!("unexpected write error: {e}"),
            }
            assert!(self.step(), "stalled with {} bytes left", data.len() - offset);
        }
        self.drive();
    }
}

/// Read everything the peer sent on `id`, returning the data and whether FIN was seen
pub(crate) fn read_all(conn: &mut Connection, id: StreamId) -> (Vec<u8>, bool) {
    let mut data = Vec::new();
    let mut buf = [0; 4096];
    loop {
        match conn.stream_recv(id, &mut buf) {
            Ok((n, fin)) => {
                data.extend_from_slice(&buf[..n]);
                if fin {
                    return (data, true);
                }
            }
            Err(ReadError::Blocked) => return (data, false),
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
}

/// Common transport settings of both sides
fn transport(config: &mut Config) {
    config.set_application_protos(&encode_alpn(&["echo"])).unwrap();
    config.set_max_idle_timeout(IDLE_TIMEOUT_MS);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_stream_data_uni(1_000_000);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(100);
}

pub(crate) fn server_config() -> Config {
    let mut config = Config::new(PROTOCOL_VERSION).unwrap();
    config.set_cert_chain(vec![CERTIFICATE.0.clone()]);
    config.set_priv_key(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        CERTIFICATE.1.clone(),
    )));
    transport(&mut config);
    config
}

pub(crate) fn client_config() -> Config {
    let mut config = Config::new(PROTOCOL_VERSION).unwrap();
    config.add_root_certificate(CERTIFICATE.0.clone()).unwrap();
    transport(&mut config);
    config
}

pub(crate) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Self-signed certificate for "localhost" and its PKCS #8 private key
static CERTIFICATE: LazyLock<(CertificateDer<'static>, Vec<u8>)> = LazyLock::new(|| {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    (cert.cert.der().clone(), cert.signing_key.serialize_der())
});
