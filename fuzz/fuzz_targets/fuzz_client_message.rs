#![no_main]

use libfuzzer_sys::fuzz_target;
use pairchat_client::protocol::ClientMessage;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ClientMessage>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<ClientMessage>(s);
    }
});
