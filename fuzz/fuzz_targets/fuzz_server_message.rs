#![no_main]

use libfuzzer_sys::fuzz_target;
use pairchat_client::protocol::ServerMessage;

fuzz_target!(|data: &[u8]| {
    // Raw bytes, including invalid UTF-8.
    let _ = serde_json::from_slice::<ServerMessage>(data);

    // Anything that decodes must survive a re-encode unchanged.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(msg) = serde_json::from_str::<ServerMessage>(s) {
            let json = serde_json::to_string(&msg).unwrap();
            let again: ServerMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(msg, again);
        }
    }
});
