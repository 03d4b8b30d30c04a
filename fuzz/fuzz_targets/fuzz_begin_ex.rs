#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz the TLS BEGIN extension decode: must not panic, and any
    // decodable extension must round-trip.
    if let Ok(ex) = milli_tls::frame::TlsBeginEx::decode(data) {
        let bytes = ex.encode();
        let again = milli_tls::frame::TlsBeginEx::decode(&bytes).unwrap();
        assert_eq!(ex, again);
    }
});
