#![no_main]

use libfuzzer_sys::fuzz_target;
use mesh_protocol::config::LivenessConfig;
use mesh_protocol::core::codec;
use mesh_protocol::protocol::auth::NoAuth;
use mesh_protocol::protocol::handshake::{Connection, Outcome, Role};
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    // Feed a stream of decoded messages into a responder; it must never panic
    let mut conn = Connection::new(
        Role::Responder,
        "ff".parse().expect("valid id"),
        vec!["mesh/1".into()],
        Arc::new(NoAuth),
        &LivenessConfig::default(),
    );

    let mut input = data;
    while let Ok(msg) = codec::decode_from(&mut input) {
        match conn.handle(msg) {
            Ok(Outcome::Closed { .. }) | Err(_) => break,
            Ok(_) => {}
        }
    }
});
