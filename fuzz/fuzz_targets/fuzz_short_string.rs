//! Fuzz target for short-string block decoding.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nd_store::string::decode_short;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = decode_short(data) {
        let len = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(text.len(), len as usize);
        assert_eq!(text.as_bytes(), &data[4..4 + text.len()]);
    }
});
