//! Fuzz target for header decoding.
//!
//! `DatabaseHeader::from_bytes` must reject arbitrary input without panicking,
//! and any header it accepts must survive an encode/decode cycle unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nd_store::DatabaseHeader;

fuzz_target!(|data: &[u8]| {
    let Ok(header) = DatabaseHeader::from_bytes(data) else {
        return;
    };
    let encoded = header.to_bytes();
    let again = DatabaseHeader::from_bytes(&encoded).expect("re-encoded header must decode");
    assert_eq!(again, header);
});
