//! Arbitrary CBOR bodies: whatever decodes must re-encode to bytes that
//! decode and encode identically. Bytes are compared rather than frames since
//! content may hold NaN.

#![no_main]

use courier_proto::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode_payload(data) else {
        return;
    };

    let Ok(bytes) = frame.to_bytes() else {
        return;
    };
    let again = Frame::decode(&bytes).expect("re-encoded frame decodes");
    assert_eq!(again.to_bytes().expect("encodes again"), bytes);
});
