#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz stream message decode: should never panic on any input.
    // It may return Ok or Err, but must not panic.
    if let Ok(msg) = milli_tls::frame::Message::decode(data) {
        // A decoded message must re-encode to something that decodes to
        // the same value.
        let bytes = msg.encode();
        let again = milli_tls::frame::Message::decode(&bytes).unwrap();
        assert_eq!(msg, again);
    }
});
