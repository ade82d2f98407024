//! Fuzz target for inbound frame decoding.
//!
//! Tests that decoding a frame into a pooled command, and reassembling it
//! as a data stream, never panics on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use object_replication::stream::DataIStream;
use object_replication::{CommandCache, CommandCacheConfig, ObjectId};

fuzz_target!(|data: &[u8]| {
    let cache = CommandCache::new(&CommandCacheConfig::default());
    let Ok(command) = cache.command_from_frame(data) else {
        return;
    };
    if command.command().is_data() {
        let mut stream = DataIStream::new(ObjectId::nil());
        if let Ok(true) = stream.add_data_packet(command) {
            let _ = stream.verify_digest();
            let _ = stream.payload_bytes();
        }
    }
});
