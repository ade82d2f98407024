//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use object_replication::change_manager::{CmContext, MasterChangeManager};
use object_replication::packet::decode_header;
use object_replication::stream::{send_saved, DataIStream, DataOStream, StreamTarget};
use object_replication::transport::Inbound;
use object_replication::{
    ChangeType, CommandCache, CommandCacheConfig, Distributable, HistoryConfig, InstanceCache, LoopbackNetwork,
    NodeId, ObjectId, Result, StreamConfig, StreamKind, Transport, Version,
};
use proptest::prelude::*;
use std::sync::Arc;

const OBJ: ObjectId = ObjectId::from_u128(0x5eed);

fn stream_config(chunk_size: usize, compress: bool) -> StreamConfig {
    StreamConfig {
        chunk_size,
        compression_enabled: compress,
        compression_level: 1,
        min_compress_size: 16,
        checksum: true,
    }
}

fn link() -> (Arc<dyn Transport>, Inbound) {
    let network = LoopbackNetwork::new();
    let (sender, _) = network.attach("master");
    let (_, inbound) = network.attach("slave");
    (sender, inbound)
}

/// Reassemble every frame waiting in `inbound` into one stream.
fn receive(inbound: &mut Inbound) -> (DataIStream, usize) {
    let cache = CommandCache::new(&CommandCacheConfig::default());
    let mut stream = DataIStream::new(OBJ);
    let mut frames = 0;
    while let Ok(frame) = inbound.try_recv() {
        frames += 1;
        let command = cache.command_from_frame(&frame).unwrap();
        stream.add_data_packet(command).unwrap();
    }
    (stream, frames)
}

// =============================================================================
// Chunking Properties
// =============================================================================

proptest! {
    /// Replayed payloads arrive intact for any chunk size and compression
    #[test]
    fn saved_payload_survives_chunking(
        payload in prop::collection::vec(any::<u8>(), 0..2000),
        chunk_size in 1usize..300,
        compress in any::<bool>(),
    ) {
        let (transport, mut inbound) = link();
        let config = stream_config(chunk_size, compress);
        let targets = [StreamTarget::all_on(NodeId::new("slave"))];

        let sent = send_saved(transport.as_ref(), &config, OBJ, StreamKind::Instance, Version(7), &payload, &targets)
            .unwrap();
        let expected_chunks = payload.len().div_ceil(chunk_size).max(1);
        prop_assert_eq!(sent as usize, expected_chunks);

        let (stream, frames) = receive(&mut inbound);
        prop_assert_eq!(frames, expected_chunks);
        prop_assert!(stream.is_ready());
        prop_assert_eq!(stream.version(), Version(7));
        prop_assert!(stream.verify_digest().is_ok());
        prop_assert_eq!(stream.payload_bytes().unwrap(), payload);
    }

    /// Values written through an output stream read back in order, and the
    /// saved copy matches what went over the wire
    #[test]
    fn ostream_values_read_back(
        values in prop::collection::vec(any::<u32>(), 1..200),
        chunk_size in 1usize..64,
    ) {
        let (transport, mut inbound) = link();
        let mut os = DataOStream::new(stream_config(chunk_size, false), transport, OBJ);
        os.enable(StreamKind::Delta, Version(3), vec![StreamTarget::all_on(NodeId::new("slave"))], true);
        for v in &values {
            os.write_u32(*v).unwrap();
        }
        let saved = os.disable().unwrap().unwrap();
        prop_assert!(os.has_sent_data());

        let (mut stream, _) = receive(&mut inbound);
        prop_assert_eq!(stream.kind(), Some(StreamKind::Delta));
        prop_assert_eq!(stream.payload_bytes().unwrap(), saved);
        for v in &values {
            prop_assert_eq!(stream.read_u32().unwrap(), *v);
        }
        prop_assert_eq!(stream.remaining(), 0);
    }

    /// Header decoding rejects arbitrary bytes without panicking
    #[test]
    fn decode_header_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_header(&data);
    }
}

// =============================================================================
// History Retention Properties
// =============================================================================

struct Value(u32);

impl Distributable for Value {
    fn change_type(&self) -> ChangeType {
        ChangeType::Instance
    }

    fn get_instance_data(&self, os: &mut DataOStream) -> Result<()> {
        os.write_u32(self.0)
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> Result<()> {
        self.0 = is.read_u32()?;
        Ok(())
    }
}

fn master_with_commits(commits: u32) -> MasterChangeManager {
    let (transport, _) = link();
    let ctx = CmContext {
        object_id: OBJ,
        transport,
        stream: StreamConfig::default(),
        history: HistoryConfig::default(),
    };
    let mut cm = MasterChangeManager::new(ChangeType::Instance, ctx);
    let mut value = Value(0);
    for i in 0..commits {
        value.0 = i;
        cm.commit(&mut value).unwrap();
    }
    cm
}

proptest! {
    /// Auto-obsoletion keeps exactly the versions of the last `keep`
    /// commits, and never less than the head
    #[test]
    fn auto_obsolete_retains_recent_window(commits in 1u32..40, keep in 0u32..12) {
        let mut cm = master_with_commits(commits);
        cm.set_auto_obsolete(keep);

        let oldest = (commits + 1).saturating_sub(keep).clamp(1, commits);
        let expected: Vec<Version> = (oldest..=commits).map(Version).collect();
        prop_assert_eq!(cm.retained_versions(), expected);
        prop_assert_eq!(cm.oldest_version(), Version(oldest));
        prop_assert_eq!(cm.head_version(), Version(commits));
    }

    /// Explicit obsoletion drops everything below the bound except the head
    #[test]
    fn obsolete_keeps_head(commits in 1u32..40, bound in 0u32..60) {
        let mut cm = master_with_commits(commits);
        cm.obsolete(Version(bound));

        let oldest = bound.clamp(1, commits);
        let expected: Vec<Version> = (oldest..=commits).map(Version).collect();
        prop_assert_eq!(cm.retained_versions(), expected);
    }

    /// Retained versions are always contiguous and ascending
    #[test]
    fn history_is_contiguous(commits in 1u32..30, ops in prop::collection::vec((any::<bool>(), 0u32..30), 0..10)) {
        let mut cm = master_with_commits(commits);
        for (auto, n) in ops {
            if auto {
                cm.set_auto_obsolete(n);
            } else {
                cm.obsolete(Version(n));
            }
        }
        let retained = cm.retained_versions();
        prop_assert!(!retained.is_empty());
        prop_assert_eq!(*retained.last().unwrap(), Version(commits));
        for pair in retained.windows(2) {
            prop_assert_eq!(pair[0].next(), pair[1]);
        }
    }
}

// =============================================================================
// Version and Cache Properties
// =============================================================================

proptest! {
    /// Sentinels sit above every committable version
    #[test]
    fn sentinels_order_above_versions(v in 0u32..0xffff_fffc) {
        let version = Version(v);
        prop_assert!(!version.is_sentinel());
        for sentinel in [Version::NEXT, Version::INVALID, Version::OLDEST, Version::HEAD] {
            prop_assert!(sentinel.is_sentinel());
            prop_assert!(version < sentinel);
        }
        prop_assert!(version.next() > version);
    }

    /// The advertised cache range is contiguous and fully present
    #[test]
    fn cached_range_is_contiguous(versions in prop::collection::btree_set(1u32..50, 1..20), bound in 1usize..10) {
        let cache = InstanceCache::new(bound);
        for v in &versions {
            cache.insert(OBJ, Version(*v), vec![*v as u8]);
        }
        let (lo, hi) = cache.cached_range(OBJ).unwrap();
        prop_assert_eq!(hi.get(), *versions.iter().max().unwrap());
        prop_assert!(lo <= hi);
        for v in lo.get()..=hi.get() {
            let payload = cache.get(OBJ, Version(v));
            prop_assert!(payload.is_some());
            let payload = payload.unwrap();
            prop_assert_eq!(payload.as_slice(), &[v as u8][..]);
        }
        prop_assert!(cache.len() <= bound);
    }
}
