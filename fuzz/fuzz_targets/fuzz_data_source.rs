#![no_main]

use libfuzzer_sys::fuzz_target;
use npipe_wire::connection::DataSource;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(ds) = DataSource::parse(input) {
        assert!(!ds.server.is_empty());
        assert!(!ds.pipe_name.is_empty());
        let _ = ds.pipe_path().unc();
    }
});
