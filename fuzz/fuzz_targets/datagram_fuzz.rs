#![no_main]
use libfuzzer_sys::fuzz_target;
use tnfsd::modules::constants::{MAX_MESSAGE_SIZE, REQUEST_HEADER_LEN};
use tnfsd::modules::proto::Datagram;

fuzz_target!(|data: &[u8]| {
    if let Some(dgram) = Datagram::parse(data) {
        assert!(data.len() >= REQUEST_HEADER_LEN && data.len() <= MAX_MESSAGE_SIZE);
        assert_eq!(dgram.encode(), data);
    }
});
