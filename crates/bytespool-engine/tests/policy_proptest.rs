use std::collections::HashMap;
use std::sync::Arc;

use bytespool_engine::config::{parser, validator};
use bytespool_engine::{BufferRegistry, FlushLimits, FlushType, InMemoryBufferFactory, MemoryManager, RecordBuffer};
use bytespool_types::{CheckpointMarker, ConfiguredCatalog, StreamDescriptor};
use proptest::prelude::*;

fn registry(limits: FlushLimits) -> BufferRegistry {
    BufferRegistry::new(
        InMemoryBufferFactory::default(),
        |_: &StreamDescriptor, _: &mut dyn RecordBuffer| -> anyhow::Result<()> { Ok(()) },
        |_: &CheckpointMarker| {},
        ConfiguredCatalog::default(),
        limits,
        Arc::new(MemoryManager::new(1 << 30, 1 << 16).expect("valid allocator")),
    )
    .expect("valid limits")
}

fn records() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0_usize..4, 1_usize..64), 1..40)
}

proptest! {
    #[test]
    fn below_thresholds_never_flushes(records in records()) {
        let mut registry = registry(FlushLimits {
            max_total_bytes: 1 << 20,
            max_per_stream_bytes: 1 << 20,
            max_concurrent_streams: 10,
        });
        let mut expected: HashMap<usize, u64> = HashMap::new();

        for (stream, size) in &records {
            let desc = StreamDescriptor::new(format!("s{stream}"));
            let signal = registry.add_record(&desc, &vec![b'r'; *size]).expect("add");
            prop_assert_eq!(signal, None);
            *expected.entry(*stream).or_default() += *size as u64;
        }

        for (stream, bytes) in &expected {
            let desc = StreamDescriptor::new(format!("s{stream}"));
            prop_assert_eq!(registry.stream_bytes(&desc), Some(*bytes));
        }
        prop_assert_eq!(registry.total_bytes(), expected.values().sum::<u64>());
    }

    #[test]
    fn running_total_tracks_live_buffers(records in records(), per_stream in 32_u64..256, total in 64_u64..512) {
        let mut registry = registry(FlushLimits {
            max_total_bytes: total,
            max_per_stream_bytes: per_stream,
            max_concurrent_streams: 3,
        });
        let names: Vec<StreamDescriptor> = (0..4).map(|i| StreamDescriptor::new(format!("s{i}"))).collect();

        for (stream, size) in &records {
            let signal = registry.add_record(&names[*stream], &vec![b'r'; *size]).expect("add");
            let live: u64 = names.iter().filter_map(|n| registry.stream_bytes(n)).sum();
            prop_assert_eq!(registry.total_bytes(), live);
            if signal == Some(FlushType::All) {
                prop_assert_eq!(registry.buffer_count(), 0);
            }
            prop_assert!(registry.buffer_count() < 3);
        }
    }

    #[test]
    fn chunk_must_fit_budget(budget_mb in 1_u64..64, chunk_mb in 1_u64..64) {
        let yaml = format!("memory:\n  max_bytes: {budget_mb}mb\n  chunk_bytes: {chunk_mb}mb\n");
        let config = parser::parse_config_str(&yaml).expect("generated yaml must parse");
        let result = validator::validate_config(&config);
        if chunk_mb > budget_mb {
            prop_assert!(result.is_err());
        } else {
            prop_assert!(result.is_ok());
        }
    }
}
