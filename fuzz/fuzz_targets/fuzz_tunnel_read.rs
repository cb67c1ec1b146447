#![no_main]

use libfuzzer_sys::fuzz_target;
use npipe_wire::connection::TlsTunnel;
use tokio::io::AsyncReadExt;

fuzz_target!(|data: &[u8]| {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };

    // Handshake-mode reads over arbitrary bytes: errors are fine, panics and
    // reads beyond the input are not.
    runtime.block_on(async {
        let mut tunnel = TlsTunnel::new(data);
        let mut out = Vec::new();
        let _ = tunnel.read_to_end(&mut out).await;
        assert!(out.len() <= data.len());
    });
});
