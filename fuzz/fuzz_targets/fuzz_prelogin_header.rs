#![no_main]

use libfuzzer_sys::fuzz_target;
use npipe_wire::protocol::constants::HEADER_LEN;
use npipe_wire::protocol::PreloginHeader;

fuzz_target!(|data: &[u8]| {
    let Some(bytes) = data.get(..HEADER_LEN) else {
        return;
    };
    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(bytes);

    // Anything that decodes must encode back to the same bytes.
    if let Ok(header) = PreloginHeader::decode(&raw) {
        assert_eq!(header.encode(), raw);
        assert!(header.payload_len() <= usize::from(header.length));
    }
});
