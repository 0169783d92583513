#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tnfsd::modules::constants::MAX_MESSAGE_SIZE;
use tnfsd::modules::dispatch::{Dispatcher, ServerContext};
use tnfsd::modules::proto::Datagram;
use tnfsd::{Auth, ServerConfig};

#[derive(Debug, Arbitrary)]
struct Input {
    read_only: bool,
    packets: Vec<(u8, Vec<u8>)>,
}

fuzz_target!(|input: Input| {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let _ = std::fs::create_dir(dir.path().join("sub"));
    let _ = std::fs::write(dir.path().join("file.txt"), "fuzz");

    let ctx = match ServerContext::new(dir.path(), Auth::open(input.read_only)) {
        Ok(ctx) => ctx,
        Err(_) => return,
    };
    let limits = ServerConfig::new(dir.path()).limits();
    let mut dispatcher = Dispatcher::new(ctx, limits);
    let start = Instant::now();

    for (i, (host, packet)) in input.packets.iter().enumerate() {
        let from = SocketAddr::from(([127, 0, 0, host % 4], 5000));
        if let Some(dgram) = Datagram::parse(packet) {
            let now = start + Duration::from_millis(i as u64);
            if let Some(reply) = dispatcher.dispatch(&dgram, from, now) {
                assert!(reply.len() <= MAX_MESSAGE_SIZE);
                assert_eq!(reply[2], dgram.sequence);
            }
        }
    }
    dispatcher.shutdown();
    assert!(dispatcher.sessions().is_empty());
});
