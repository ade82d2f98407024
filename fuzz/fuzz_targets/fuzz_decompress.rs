//! Fuzz target for chunk decompression.
//!
//! `decompress_chunk` must never panic, whatever the payload and declared
//! length.

#![no_main]

use libfuzzer_sys::fuzz_target;
use object_replication::packet::Compressor;
use object_replication::stream::decompress_chunk;

fuzz_target!(|input: (bool, u32, &[u8])| {
    let (zstd, declared, data) = input;
    let compressor = if zstd { Compressor::Zstd } else { Compressor::None };
    let _ = decompress_chunk(compressor, data, u64::from(declared));
});
