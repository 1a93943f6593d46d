//! Arbitrary bytes through the prefixed frame decoder.
//!
//! Must never panic, and never accept a prefix above the size cap.

#![no_main]

use courier_proto::{Frame, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some(prefix) = data.first_chunk::<LENGTH_PREFIX_SIZE>() {
        if let Ok(size) = Frame::payload_len(*prefix) {
            assert!(size <= MAX_PAYLOAD_SIZE);
        }
    }

    let _ = Frame::decode(data);
});
