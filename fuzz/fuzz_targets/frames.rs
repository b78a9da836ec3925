#![no_main]

use libfuzzer_sys::fuzz_target;
use quic_engine::fuzzing::decode_frames;

fuzz_target!(|data: &[u8]| {
    assert!(decode_frames(data) <= data.len());
});
