#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_protocol::core::codec;

fuzz_target!(|data: &[u8]| {
    // Any input must decode or fail cleanly; accepted input must re-encode to the same message
    if let Ok(msg) = codec::decode(data) {
        let encoded = codec::encode(&msg).expect("decoded message must encode");
        assert_eq!(codec::decode(&encoded).ok(), Some(msg));
    }
});
