#![no_main]

use libfuzzer_sys::fuzz_target;
use network_engine::protocol::handshake::{parse_request, verify_response};

fuzz_target!(|data: &[u8]| {
    // Fuzz upgrade request and response parsing
    if let Ok(head) = std::str::from_utf8(data) {
        if let Ok(request) = parse_request(head) {
            let _ = verify_response(head, &request.key);
        }
    }
});
