#![no_main]

use libfuzzer_sys::fuzz_target;
use quic_engine::fuzzing::split_datagram;

fuzz_target!(|data: &[u8]| {
    let Some((&cid_len, datagram)) = data.split_first() else {
        return;
    };
    let lens = split_datagram(datagram, usize::from(cid_len % 21));
    assert!(lens.iter().sum::<usize>() <= datagram.len());
});
