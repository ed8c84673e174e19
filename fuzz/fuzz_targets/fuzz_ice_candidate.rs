#![no_main]

use libfuzzer_sys::fuzz_target;
use pairchat_client::protocol::IceCandidate;

fuzz_target!(|data: &[u8]| {
    // Candidate lines come straight from the peer; validation must never panic.
    if let Ok(line) = std::str::from_utf8(data) {
        let candidate = IceCandidate::new(line);
        let _ = candidate.validate();
        let _ = candidate.is_end_of_candidates();
    }
});
