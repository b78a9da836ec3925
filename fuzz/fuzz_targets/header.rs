#![no_main]

use libfuzzer_sys::fuzz_target;
use quic_engine::{PacketType, is_version_negotiation, parse_header};

fuzz_target!(|data: &[u8]| {
    let Some((&cid_len, buf)) = data.split_first() else {
        return;
    };
    if let Ok(header) = parse_header(buf, usize::from(cid_len % 21)) {
        if header.ty == PacketType::VersionNegotiation {
            assert!(is_version_negotiation(buf));
        }
        assert_eq!(header.versions.is_some(), header.ty == PacketType::VersionNegotiation);
    }
});
