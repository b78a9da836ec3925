use std::{
    net::{Ipv6Addr, SocketAddr},
    time::Duration,
};

use assert_matches::assert_matches;
use hex_literal::hex;

use super::*;

pub(crate) mod util;
use util::*;

const STREAM_0: StreamId = StreamId(0);

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port)
}

#[test]
fn handshake() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    assert!(pair.client.is_established());
    assert!(pair.server().is_established());
    assert!(pair.client.peer_error().is_none());
    assert!(pair.client.local_error().is_none());
    assert!(pair.server().peer_error().is_none());
    assert!(pair.server().local_error().is_none());
    assert!(!pair.client.is_server());
    assert!(pair.server().is_server());
    assert_eq!(pair.client.application_proto(), b"echo");
    assert_eq!(pair.server().application_proto(), b"echo");

    let params = pair.client.peer_transport_params().unwrap();
    assert_eq!(
        params.max_idle_timeout,
        Some(Duration::from_millis(IDLE_TIMEOUT_MS))
    );
    assert_eq!(params.initial_max_data, 10_000_000);
    assert_eq!(params.initial_max_streams_bidi, 100);
    assert_eq!(params.max_datagram_frame_size, None);
    assert!(!params.disable_active_migration);

    // Each side addresses the other with the CID the other picked
    let server_scid = pair.server().source_id();
    assert_eq!(pair.client.destination_id(), server_scid);
    let client_scid = pair.client.source_id();
    assert_eq!(pair.server().destination_id(), client_scid);
}

#[test]
fn handshake_with_latency() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.latency = Duration::from_millis(10);
    pair.connect();
    pair.drive();

    let stats = pair.client.path_stats();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].active);
    assert_eq!(stats[0].validation_state, PathState::Validated);
    assert!(stats[0].min_rtt >= Duration::from_millis(20));
    assert!(stats[0].cwnd > 0);
    assert_eq!(pair.client.stats().paths_count, 1);
}

#[test]
fn echo() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    assert_eq!(pair.client.stream_send(STREAM_0, b"ping", true), Ok(4));
    pair.drive();

    assert_eq!(pair.server().stream_readable_next(), Some(STREAM_0));
    let mut buf = [0; 64];
    assert_eq!(pair.server().stream_recv(STREAM_0, &mut buf), Ok((4, true)));
    assert_eq!(&buf[..4], b"ping");
    assert_eq!(pair.server().stream_readable_next(), None);

    assert_eq!(pair.server().stream_send(STREAM_0, b"ping", true), Ok(4));
    pair.drive();
    assert!(pair.client.stream_readable(STREAM_0));
    assert_eq!(read_all(&mut pair.client, STREAM_0), (b"ping".to_vec(), true));
    assert!(pair.client.is_established());
    assert!(pair.server().is_established());

    // Nothing was sent anywhere but the server's address
    assert!(pair.client_sent.iter().all(|info| info.to == pair.server_addr));
}

#[test]
fn send_reports_nothing_to_send_until_new_work() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let mut buf = vec![0; DATAGRAM_BUDGET];
    let now = pair.time;
    assert_matches!(pair.client.send(&mut buf, now), Ok(None));
    assert_matches!(pair.client.send(&mut buf, now), Ok(None));
    assert_matches!(pair.server().send(&mut buf, now), Ok(None));

    pair.client.stream_send(STREAM_0, b"more", false).unwrap();
    assert_matches!(pair.client.send(&mut buf, now), Ok(Some((len, info))) => {
        assert!(len <= DATAGRAM_BUDGET);
        assert_eq!(info.to, pair.server_addr);
        assert_eq!(info.from, pair.client_addr);
    });
    assert_matches!(pair.client.send(&mut buf, now), Ok(None));
}

#[test]
fn send_rejects_small_buffer() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    let mut buf = vec![0; MIN_CLIENT_INITIAL_LEN - 1];
    let now = pair.time;
    assert_eq!(pair.client.send(&mut buf, now), Err(BufferTooShort));
}

#[test]
fn large_transfer_survives_fragmentation() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    let data = (0..100_000u32).map(|i| i as u8).collect::<Vec<_>>();
    pair.client_send_all(STREAM_0, &data);
    assert_eq!(read_all(pair.server(), STREAM_0), (data, true));

    // FIN is reported exactly once
    let mut buf = [0; 16];
    assert_matches!(
        pair.server().stream_recv(STREAM_0, &mut buf),
        Err(ReadError::ClosedStream)
    );
}

#[test]
fn lost_packets_are_retransmitted() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let data = vec![0xab; 5000];
    pair.drop_to_server = 2;
    pair.client_send_all(STREAM_0, &data);
    assert_eq!(read_all(pair.server(), STREAM_0), (data, true));

    let stats = pair.client.stats();
    assert!(stats.lost > 0);
    assert!(stats.lost_bytes > 0);
    assert!(stats.stream_retrans_bytes > 0);
}

#[test]
fn stream_flow_control() {
    let _guard = subscribe();
    let mut server_config = server_config();
    server_config.set_initial_max_stream_data_bidi_remote(1000);
    let mut pair = Pair::new(&client_config(), server_config);
    pair.connect();

    let data = vec![7; 5000];
    assert_eq!(pair.client.stream_send(STREAM_0, &data, false), Ok(1000));
    assert_eq!(
        pair.client.stream_send(STREAM_0, &data[1000..], false),
        Err(WriteError::Blocked)
    );
    assert_eq!(pair.client.stream_capacity(STREAM_0), Ok(0));
    pair.drive();

    // Reading on the server extends the window
    let (received, fin) = read_all(pair.server(), STREAM_0);
    assert_eq!(received.len(), 1000);
    assert!(!fin);
    pair.drive();
    assert_eq!(pair.client.stream_writable_next(), Some(STREAM_0));
    assert!(pair.client.stream_capacity(STREAM_0).unwrap() > 0);

    // The server keeps reading, so the window keeps moving until everything arrived
    let mut offset = received.len();
    let mut total = received.len();
    loop {
        if offset < data.len() {
            match pair.client.stream_send(STREAM_0, &data[offset..], true) {
                Ok(n) => offset += n,
                Err(WriteError::Blocked) => {}
                Err(e) => panic!("unexpected write error: {e}"),
            }
        }
        pair.drive();
        let (chunk, fin) = read_all(pair.server(), STREAM_0);
        total += chunk.len();
        if fin {
            break;
        }
    }
    assert_eq!(offset, data.len());
    assert_eq!(total, data.len());
}

#[test]
fn stream_limit() {
    let _guard = subscribe();
    let mut server_config = server_config();
    server_config.set_initial_max_streams_bidi(1);
    let mut pair = Pair::new(&client_config(), server_config);
    pair.connect();

    assert_eq!(pair.client.stream_send(STREAM_0, b"a", true), Ok(1));
    let second = StreamId::new(Side::Client, Dir::Bi, 1);
    assert_eq!(
        pair.client.stream_send(second, b"b", true),
        Err(WriteError::StreamLimit)
    );

    // Finishing the first stream on both ends lets the server raise the limit
    pair.drive();
    assert_eq!(read_all(pair.server(), STREAM_0), (b"a".to_vec(), true));
    pair.server().stream_send(STREAM_0, b"", true).unwrap();
    pair.drive();
    assert_eq!(read_all(&mut pair.client, STREAM_0), (Vec::new(), true));
    pair.drive();
    assert_eq!(pair.client.stream_send(second, b"b", true), Ok(1));
}

#[test]
fn invalid_stream_ids() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    // Clients can't write to server-initiated unidirectional streams
    let server_uni = StreamId::new(Side::Server, Dir::Uni, 0);
    assert_eq!(
        pair.client.stream_send(server_uni, b"x", false),
        Err(WriteError::InvalidStream)
    );
    let mut buf = [0; 4];
    let client_uni = StreamId::new(Side::Client, Dir::Uni, 0);
    assert_eq!(
        pair.client.stream_recv(client_uni, &mut buf),
        Err(ReadError::InvalidStream)
    );
}

#[test]
fn stream_reset_and_stop_sending() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    pair.client.stream_send(STREAM_0, b"partial", false).unwrap();
    pair.drive();
    pair.client
        .stream_shutdown(STREAM_0, Direction::Write, 42)
        .unwrap();
    pair.drive();

    let mut buf = [0; 64];
    let server = pair.server();
    let result = loop {
        match server.stream_recv(STREAM_0, &mut buf) {
            Ok(_) => continue,
            other => break other,
        }
    };
    assert_eq!(result, Err(ReadError::Reset(VarInt(42))));

    // The server asks the client to stop sending on a fresh stream
    let stream = StreamId::new(Side::Client, Dir::Bi, 1);
    pair.client.stream_send(stream, b"hello", false).unwrap();
    pair.drive();
    pair.server()
        .stream_shutdown(stream, Direction::Read, 7)
        .unwrap();
    pair.drive_server();
    // Keep the client's RESET_STREAM unacknowledged so the stream stays around
    pair.drop_to_server = usize::MAX;
    pair.drive_client();
    assert_eq!(
        pair.client.stream_send(stream, b"more", false),
        Err(WriteError::Stopped(VarInt(7)))
    );
}

#[test]
fn stream_priority() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    let low = StreamId::new(Side::Client, Dir::Bi, 0);
    let high = StreamId::new(Side::Client, Dir::Bi, 1);
    pair.client.stream_send(low, b"low", true).unwrap();
    pair.client.stream_send(high, b"high", true).unwrap();
    pair.client.stream_priority(low, 200, false).unwrap();
    pair.client.stream_priority(high, 0, false).unwrap();
    pair.drive();

    assert_eq!(read_all(pair.server(), high), (b"high".to_vec(), true));
    assert_eq!(read_all(pair.server(), low), (b"low".to_vec(), true));
}

#[test]
fn application_close() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    pair.client.close(true, 42, b"bye").unwrap();
    assert!(pair.client.is_draining());
    assert_matches!(
        pair.client.close(true, 43, b""),
        Err(ConnectionError::LocallyClosed)
    );
    pair.drive();

    let close = pair.server().peer_error().unwrap().clone();
    assert!(close.is_app());
    assert_eq!(close.error_code(), 42);
    assert_eq!(close.reason(), b"bye");
    let local = pair.client.local_error().unwrap();
    assert_eq!(local.error_code(), 42);

    // Both sides linger in the closing/draining period, then go away
    pair.time += Duration::from_secs(5);
    pair.drive();
    assert!(pair.client.is_closed());
    assert!(pair.server().is_closed());
    assert!(!pair.client.is_timed_out());
    assert_eq!(pair.client.timeout_instant(), None);
}

#[test]
fn transport_close_from_server() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    pair.server().close(false, 0x0a, b"").unwrap();
    pair.drive();
    let close = pair.client.peer_error().unwrap();
    assert!(!close.is_app());
    assert_eq!(close.error_code(), 0x0a);
    assert_matches!(
        pair.client.stream_send(STREAM_0, b"x", false),
        Err(WriteError::ClosedStream)
    );
}

#[test]
fn close_before_handshake() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.drive_client();
    pair.client.close(false, 0, b"").unwrap();
    pair.drive();
    assert!(!pair.client.is_established());
}

#[test]
fn idle_timeout() {
    let _guard = subscribe();
    let mut client_config = client_config();
    client_config.set_max_idle_timeout(1000);
    let mut server_config = server_config();
    server_config.set_max_idle_timeout(1000);
    let mut pair = Pair::new(&client_config, server_config);
    pair.connect();
    let start = pair.time;
    pair.drive();

    assert!(pair.client.is_timed_out());
    assert!(pair.server().is_timed_out());
    assert!(pair.client.is_closed());
    assert!(pair.time - start >= Duration::from_millis(1000));
    assert!(pair.client.local_error().is_none());
    assert!(pair.client.peer_error().is_none());
}

#[test]
fn keep_alive_prevents_idle_timeout() {
    let _guard = subscribe();
    let mut client_config = client_config();
    client_config.set_max_idle_timeout(1000);
    client_config.set_keep_alive_interval(Some(Duration::from_millis(300)));
    let mut pair = Pair::new(&client_config, server_config());
    pair.connect();

    let deadline = pair.time + Duration::from_secs(5);
    while pair.time < deadline {
        assert!(pair.step());
    }
    assert!(pair.client.is_established());
    assert!(pair.server().is_established());
    assert!(!pair.client.is_timed_out());
}

#[test]
fn timeout_is_relative_to_now() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let now = pair.time;
    let deadline = pair.client.timeout_instant().unwrap();
    assert_eq!(pair.client.timeout(now), Some(deadline - now));
    assert_eq!(
        pair.client.timeout(deadline + Duration::from_secs(1)),
        Some(Duration::ZERO)
    );
}

#[test]
fn datagrams_not_negotiated() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();

    assert_eq!(
        pair.client.dgram_send(b"hello"),
        Err(SendDatagramError::NotNegotiated)
    );
    assert_eq!(pair.client.dgram_max_writable_len(), None);
}

#[test]
fn datagrams() {
    let _guard = subscribe();
    let mut client_config = client_config();
    client_config.enable_dgram(true, 10, 10);
    let mut server_config = server_config();
    server_config.enable_dgram(true, 10, 10);
    let mut pair = Pair::new(&client_config, server_config);
    pair.connect();

    let max = pair.client.dgram_max_writable_len().unwrap();
    assert!(max > 1000 && max < DATAGRAM_BUDGET);
    assert_eq!(
        pair.client.dgram_send(&vec![0; max + 1]),
        Err(SendDatagramError::TooLarge)
    );

    pair.client.dgram_send(b"hello").unwrap();
    pair.client.dgram_send(b"world!").unwrap();
    assert_eq!(pair.client.dgram_send_queue_len(), 2);
    assert_eq!(pair.client.dgram_send_queue_byte_size(), 11);
    pair.drive();
    assert_eq!(pair.client.dgram_send_queue_len(), 0);

    assert_eq!(pair.server().dgram_recv_queue_len(), 2);
    assert_eq!(pair.server().dgram_recv_queue_byte_size(), 11);
    let mut small = [0; 2];
    assert_eq!(pair.server().dgram_recv(&mut small), Err(BufferTooShort));
    let mut buf = [0; 64];
    assert_eq!(pair.server().dgram_recv(&mut buf), Ok(Some(5)));
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(pair.server().dgram_recv(&mut buf), Ok(Some(6)));
    assert_eq!(&buf[..6], b"world!");
    assert_eq!(pair.server().dgram_recv(&mut buf), Ok(None));
}

#[test]
fn datagram_queue_policies() {
    let _guard = subscribe();
    let mut client_config = client_config();
    client_config.enable_dgram(true, 2, 2);
    let mut server_config = server_config();
    server_config.enable_dgram(true, 2, 2);
    let mut pair = Pair::new(&client_config, server_config);
    pair.connect();

    pair.client.dgram_send(b"one").unwrap();
    pair.client.dgram_send(b"two").unwrap();
    pair.client.dgram_send(b"three").unwrap();
    assert_eq!(pair.client.dgram_send_queue_len(), 2);
    pair.client.dgram_purge_outgoing(|d| d == b"two");
    assert_eq!(pair.client.dgram_send_queue_len(), 1);
    pair.drive();

    let mut buf = [0; 16];
    assert_eq!(pair.server().dgram_recv(&mut buf), Ok(Some(5)));
    assert_eq!(&buf[..5], b"three");

    let mut client_config = util::client_config();
    client_config.enable_dgram(true, 2, 1);
    client_config.set_dgram_full_policy(DatagramFullPolicy::Reject);
    let mut server_config = util::server_config();
    server_config.enable_dgram(true, 2, 2);
    let mut pair = Pair::new(&client_config, server_config);
    pair.connect();
    pair.client.dgram_send(b"one").unwrap();
    assert_eq!(
        pair.client.dgram_send(b"two"),
        Err(SendDatagramError::QueueFull)
    );
}

#[test]
fn version_negotiation_without_common_version() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.drive_client();

    let dcid = pair.client.source_id();
    let scid = pair.client.destination_id();
    let mut packet = vec![0xc5];
    packet.extend_from_slice(&hex!("00000000"));
    packet.push(dcid.len() as u8);
    packet.extend_from_slice(&dcid);
    packet.push(scid.len() as u8);
    packet.extend_from_slice(&scid);
    packet.extend_from_slice(&hex!("0a1a2a3a ff00001d"));
    assert!(is_version_negotiation(&packet));

    let info = RecvInfo {
        from: pair.server_addr,
        to: pair.client_addr,
    };
    let now = pair.time;
    assert_matches!(
        pair.client.recv(&mut packet, info, now),
        Err(ConnectionError::VersionMismatch)
    );
    assert!(pair.client.is_closed());
    let mut again = vec![0; 1200];
    assert_matches!(
        pair.client.recv(&mut again, info, now),
        Err(ConnectionError::VersionMismatch)
    );
}

#[test]
fn version_negotiation_listing_our_version_is_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.drive_client();

    let mut buf = [0; 128];
    let len = negotiate_version(
        &pair.client.source_id(),
        &pair.client.destination_id(),
        &mut buf,
    )
    .unwrap();
    let header = parse_header(&buf[..len], CID_LEN).unwrap();
    assert_eq!(header.ty, PacketType::VersionNegotiation);
    assert!(header.versions.unwrap().contains(&PROTOCOL_VERSION));

    pair.inject_to_client(buf[..len].to_vec());
    pair.connect();
    assert!(pair.client_error.is_none());
}

#[test]
fn retry() {
    let _guard = subscribe();
    let mut pair = Pair::with_retry(&client_config(), server_config(), true);
    pair.connect();
    assert!(pair.client_error.is_none());
    assert!(pair.server_error.is_none());

    // The server's address validation came from the token, not the handshake
    let server_paths = pair.server().path_stats();
    assert_eq!(server_paths[0].validation_state, PathState::Validated);

    pair.client.stream_send(STREAM_0, b"after retry", true).unwrap();
    pair.drive();
    assert_eq!(
        read_all(pair.server(), STREAM_0),
        (b"after retry".to_vec(), true)
    );
}

#[test]
fn resumption_with_early_data() {
    let _guard = subscribe();
    let mut client_config = client_config();
    client_config.enable_early_data();
    let mut server_config = server_config();
    server_config.enable_early_data();
    let mut pair = Pair::new(&client_config, server_config);
    pair.connect();
    // Deliver the session ticket
    pair.drive();
    assert!(!pair.client.is_resumed());
    assert!(!pair.client.is_in_early_data());

    pair.reconnect(&client_config);
    assert!(pair.client.is_in_early_data());
    assert_eq!(pair.client.stream_send(STREAM_0, b"early", true), Ok(5));
    pair.connect();
    assert!(pair.client.is_resumed());
    assert!(pair.server().is_resumed());
    assert!(pair.client.accepted_0rtt());
    assert!(!pair.client.is_in_early_data());

    pair.drive();
    assert_eq!(read_all(pair.server(), STREAM_0), (b"early".to_vec(), true));
    assert!(pair.client_error.is_none());
    assert!(pair.server_error.is_none());
}

#[test]
fn wrong_server_name_fails_handshake() {
    let _guard = subscribe();
    let client_config = client_config();
    let mut pair = Pair::new(&client_config, server_config());
    pair.client = Connection::connect(
        Some("example.com"),
        &generate_cid(CID_LEN),
        pair.client_addr,
        pair.server_addr,
        &client_config,
        pair.time,
    )
    .unwrap();
    pair.drive();

    assert!(!pair.client.is_established());
    let close = pair.client.local_error().unwrap();
    assert!(!close.is_app());
    assert!((0x100..0x200).contains(&close.error_code()));
}

#[test]
fn server_requires_tls_material() {
    let _guard = subscribe();
    let config = Config::new(PROTOCOL_VERSION).unwrap();
    let result = Connection::accept(
        &generate_cid(CID_LEN),
        None,
        addr(4433),
        addr(44433),
        &config,
        std::time::Instant::now(),
    );
    assert_matches!(result, Err(ConnectError::MissingTlsConfig(_)));

    let long_cid = [0; MAX_CONN_ID_LEN + 1];
    let result = Connection::connect(
        None,
        &long_cid,
        addr(44433),
        addr(4433),
        &client_config(),
        std::time::Instant::now(),
    );
    assert_matches!(result, Err(ConnectError::InvalidCidLength(_)));
}

#[test]
fn migrate_switches_path_and_retires_cid() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();
    assert_eq!(pair.client.available_dcids(), 1);

    let new_local = addr(44434);
    let server_addr = pair.server_addr;
    let now = pair.time;
    assert_eq!(pair.client.migrate(new_local, server_addr, now), Ok(1));

    // The old CID is gone and no spare is left until the server issues another
    assert_eq!(pair.client.available_dcids(), 0);
    assert_eq!(pair.client.retire_dcid(0), Err(PathError::UnknownCid));
    assert_eq!(
        pair.client.migrate(addr(44435), server_addr, now),
        Err(PathError::NoAvailableDcid)
    );

    let sent_before = pair.client_sent.len();
    pair.client_addr = new_local;
    pair.client.stream_send(STREAM_0, b"moved", true).unwrap();
    pair.drive();
    assert!(pair.client_sent.len() > sent_before);
    assert!(pair.client_sent[sent_before..]
        .iter()
        .all(|info| info.from == new_local && info.to == server_addr));

    assert_eq!(read_all(pair.server(), STREAM_0), (b"moved".to_vec(), true));
    assert_eq!(pair.client.is_path_validated(new_local, server_addr), Ok(true));
    let active = pair
        .server()
        .path_stats()
        .into_iter()
        .find(|path| path.active)
        .unwrap();
    assert_eq!(active.peer_addr, new_local);

    // The server replaced the retired CID
    assert_eq!(pair.client.available_dcids(), 1);
}

#[test]
fn migrate_fails_fast_without_spare_cid() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let server_addr = pair.server_addr;
    let now = pair.time;
    // Use the only spare for a probe, leaving nothing for a migration
    pair.client.probe_path(addr(44434), server_addr, now).unwrap();
    assert_eq!(pair.client.available_dcids(), 0);

    let active_before = pair.client.path_stats().into_iter().find(|p| p.active);
    assert_eq!(
        pair.client.migrate(addr(44435), server_addr, now),
        Err(PathError::NoAvailableDcid)
    );
    let active_after = pair.client.path_stats().into_iter().find(|p| p.active);
    assert_eq!(
        active_before.map(|p| p.local_addr),
        active_after.map(|p| p.local_addr)
    );
}

#[test]
fn migrate_requires_established_client() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    let now = pair.time;
    let server_addr = pair.server_addr;
    assert_eq!(
        pair.client.migrate(addr(44434), server_addr, now),
        Err(PathError::InvalidState)
    );

    pair.connect();
    let client_addr = pair.client_addr;
    assert_eq!(
        pair.server().migrate(addr(4434), client_addr, now),
        Err(PathError::InvalidState)
    );
    assert_eq!(
        pair.client.is_path_validated(addr(1), server_addr),
        Err(PathError::UnknownPath)
    );
}

#[test]
fn migration_disabled_by_server() {
    let _guard = subscribe();
    let mut server_config = server_config();
    server_config.set_disable_active_migration(true);
    let mut pair = Pair::new(&client_config(), server_config);
    pair.connect();
    pair.drive();

    let server_addr = pair.server_addr;
    let now = pair.time;
    assert_eq!(
        pair.client.migrate(addr(44434), server_addr, now),
        Err(PathError::ActiveMigrationDisabled)
    );
}

#[test]
fn probe_path_keeps_active_path() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let probed = addr(44434);
    let server_addr = pair.server_addr;
    let now = pair.time;
    assert_eq!(pair.client.probe_path(probed, server_addr, now), Ok(1));
    assert_eq!(pair.client.is_path_validated(probed, server_addr), Ok(false));
    pair.drive();

    assert_eq!(pair.client.is_path_validated(probed, server_addr), Ok(true));
    let paths = pair.client.path_stats();
    assert_eq!(paths.len(), 2);
    let active = paths.iter().find(|path| path.active).unwrap();
    assert_eq!(active.local_addr, pair.client_addr);
    assert!(pair
        .client_sent
        .iter()
        .any(|info| info.from == probed && info.to == server_addr));
}

#[test]
fn migrate_source_keeps_peer() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let new_local = addr(44434);
    let now = pair.time;
    pair.client.migrate_source(new_local, now).unwrap();
    pair.client_addr = new_local;
    pair.drive();
    let active = pair
        .client
        .path_stats()
        .into_iter()
        .find(|path| path.active)
        .unwrap();
    assert_eq!(active.local_addr, new_local);
    assert_eq!(active.peer_addr, pair.server_addr);
    assert_eq!(active.validation_state, PathState::Validated);
}

#[test]
fn failed_migration_falls_back_to_previous_path() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let old_local = pair.client_addr;
    let new_local = addr(44434);
    let server_addr = pair.server_addr;
    let now = pair.time;
    pair.unreachable = Some(new_local);
    pair.client.migrate(new_local, server_addr, now).unwrap();
    pair.client.stream_send(STREAM_0, b"fallback", true).unwrap();
    pair.drive();

    assert_eq!(pair.client.is_path_validated(new_local, server_addr), Ok(false));
    let active = pair
        .client
        .path_stats()
        .into_iter()
        .find(|path| path.active)
        .unwrap();
    assert_eq!(active.local_addr, old_local);
    assert_eq!(active.peer_addr, server_addr);
    assert_eq!(active.validation_state, PathState::Validated);
    assert!(pair.client.is_established());
    assert!(pair.client_error.is_none());
    assert_eq!(read_all(pair.server(), STREAM_0), (b"fallback".to_vec(), true));
}

#[test]
fn server_follows_nat_rebinding() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.drive();

    let rebound = addr(50000);
    pair.nat = Some(rebound);
    pair.client.stream_send(STREAM_0, b"rebound", true).unwrap();
    pair.drive();

    assert_eq!(read_all(pair.server(), STREAM_0), (b"rebound".to_vec(), true));
    let active = pair
        .server()
        .path_stats()
        .into_iter()
        .find(|path| path.active)
        .unwrap();
    assert_eq!(active.peer_addr, rebound);
    assert_eq!(active.validation_state, PathState::Validated);
    assert_eq!(pair.server().stats().paths_count, 2);
    assert!(pair.client.is_established());
}

#[test]
fn pmtu_discovery() {
    let _guard = subscribe();
    let mut client_config = client_config();
    client_config.discover_pmtu(true);
    client_config.set_max_send_udp_payload_size(1452);
    let mut pair = Pair::new(&client_config, server_config());
    pair.buf_size = 1500;
    pair.connect();
    assert!(pair.client.pmtu() >= 1200);
    pair.drive();
    assert_eq!(pair.client.pmtu(), 1452);
    assert_eq!(pair.client.path_stats()[0].pmtu, 1452);
}

#[test]
fn pmtu_capped_by_link() {
    let _guard = subscribe();
    let mut client_config = client_config();
    client_config.discover_pmtu(true);
    client_config.set_max_send_udp_payload_size(1452);
    let mut pair = Pair::new(&client_config, server_config());
    pair.buf_size = 1500;
    pair.mtu = 1400;
    pair.connect();
    pair.drive();
    let pmtu = pair.client.pmtu();
    assert!(pmtu > 1200);
    assert!(pmtu <= 1400);

    // A fresh search can't exceed what the link carries either
    pair.client.revalidate_pmtu();
    pair.drive();
    assert!(pair.client.pmtu() <= 1400);
    assert!(pair.client.is_established());
}

#[test]
fn congestion_controllers_complete_transfer() {
    for algorithm in ["reno", "cubic", "bbr"] {
        let _guard = subscribe();
        let mut client_config = client_config();
        client_config.set_cc_algorithm_name(algorithm).unwrap();
        let mut pair = Pair::new(&client_config, server_config());
        pair.latency = Duration::from_millis(5);
        pair.connect();

        let data = vec![1; 200_000];
        pair.client_send_all(STREAM_0, &data);
        assert_eq!(read_all(pair.server(), STREAM_0).0.len(), data.len());
        let path = &pair.client.path_stats()[0];
        assert!(path.cwnd > 0, "{algorithm}");
        assert!(path.delivery_rate > 0, "{algorithm}");
    }
}

#[test]
fn stats_count_traffic() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    pair.connect();
    pair.client.stream_send(STREAM_0, b"ping", true).unwrap();
    pair.drive();

    let client = pair.client.stats();
    let server = pair.server().stats();
    assert!(client.sent > 0);
    assert!(client.recv > 0);
    assert!(client.sent_bytes >= client.sent * 20);
    assert_eq!(client.sent_bytes, server.recv_bytes);
    assert_eq!(client.lost, 0);
    let path = &pair.client.path_stats()[0];
    assert_eq!(path.local_addr, pair.client_addr);
    assert_eq!(path.peer_addr, pair.server_addr);
    assert_eq!(path.sent_bytes, client.sent_bytes);
}

#[test]
fn header_routing() {
    let _guard = subscribe();
    let mut pair = Pair::default_pair();
    let mut buf = vec![0; DATAGRAM_BUDGET];
    let now = pair.time;
    let (len, info) = pair.client.send(&mut buf, now).unwrap().unwrap();
    assert!(len >= MIN_CLIENT_INITIAL_LEN);
    assert_eq!(info.to, pair.server_addr);

    let header = parse_header(&buf[..len], CID_LEN).unwrap();
    assert_eq!(header.ty, PacketType::Initial);
    assert_eq!(header.version, PROTOCOL_VERSION);
    assert_eq!(header.scid, pair.client.source_id());
    assert_eq!(header.dcid, pair.client.destination_id());
    assert_eq!(header.token, Some(Vec::new()));
    assert!(!is_version_negotiation(&buf[..len]));
}
