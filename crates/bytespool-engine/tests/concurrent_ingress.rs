//! Concurrent-mode behaviour: many producers, one draining consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use bytespool_engine::{
    AsyncFlusher, BackpressurePolicy, BufferManager, MemoryAllocator, MemoryAwareBatch,
    MemoryManager,
};
use bytespool_types::{CheckpointMarker, StreamDescriptor};
use rstest::rstest;
use serde_json::json;

fn encode(producer: u64, seq: u64) -> Bytes {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&producer.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    Bytes::from(buf)
}

fn decode(payload: &[u8]) -> (u64, u64) {
    let producer = u64::from_be_bytes(payload[..8].try_into().unwrap());
    let seq = u64::from_be_bytes(payload[8..16].try_into().unwrap());
    (producer, seq)
}

fn fast_policy() -> BackpressurePolicy {
    BackpressurePolicy {
        retries_before_sleep: 2,
        sleep: Duration::from_millis(1),
    }
}

#[rstest]
#[case(2, 200, 1 << 20)]
#[case(4, 250, 1 << 20)]
#[case(8, 100, 512)]
fn producers_keep_fifo_order_per_stream(
    #[case] producers: u64,
    #[case] per_producer: u64,
    #[case] budget: u64,
) {
    let memory = Arc::new(MemoryManager::new(budget, 64).unwrap());
    let manager = BufferManager::new(memory.clone(), fast_policy());
    let stream = StreamDescriptor::new("events");
    let dequeue = manager.dequeue();
    let total = producers * per_producer;

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let enqueue = manager.enqueue();
            let stream = stream.clone();
            thread::spawn(move || {
                for seq in 0..per_producer {
                    enqueue.add_record(&stream, encode(p, seq), 16).unwrap();
                }
            })
        })
        .collect();

    let mut next_expected: HashMap<u64, u64> = HashMap::new();
    let mut seen = 0;
    while seen < total {
        let batch = dequeue.take(&stream, 128).unwrap();
        if batch.is_empty() {
            thread::yield_now();
            continue;
        }
        for record in batch.records() {
            let (producer, seq) = decode(&record.payload);
            let expected = next_expected.entry(producer).or_insert(0);
            assert_eq!(seq, *expected, "producer {producer} out of order");
            *expected += 1;
            seen += 1;
        }
        assert!(memory.current_memory_bytes() <= budget);
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(manager.close().unwrap());
    assert_eq!(memory.current_memory_bytes(), 0);
}

#[test]
fn zero_grants_stall_but_never_drop() {
    // Budget is a single chunk; the producer must wait for the consumer.
    let memory = Arc::new(MemoryManager::new(32, 32).unwrap());
    let manager = BufferManager::new(memory.clone(), fast_policy());
    let stream = StreamDescriptor::new("slow");
    let enqueue = manager.enqueue();
    let dequeue = manager.dequeue();

    let producer = {
        let stream = stream.clone();
        thread::spawn(move || {
            for seq in 0..20 {
                enqueue.add_record(&stream, encode(0, seq), 16).unwrap();
            }
        })
    };

    let mut received = Vec::new();
    while received.len() < 20 {
        let batch = dequeue.take(&stream, 16).unwrap();
        for record in batch.records() {
            received.push(decode(&record.payload).1);
        }
        thread::sleep(Duration::from_millis(2));
    }
    producer.join().unwrap();
    assert_eq!(received, (0..20).collect::<Vec<_>>());
}

#[test]
fn flusher_emits_each_marker_once_with_concurrent_producers() {
    let memory = Arc::new(MemoryManager::new(1 << 20, 1024).unwrap());
    let manager = BufferManager::new(memory, fast_policy());
    let written = Arc::new(AtomicU64::new(0));
    let emitted: Arc<Mutex<Vec<CheckpointMarker>>> = Arc::default();

    let w = Arc::clone(&written);
    let e = Arc::clone(&emitted);
    let flusher = AsyncFlusher::new(
        manager.dequeue(),
        Arc::clone(manager.tracker()),
        move |batch: &MemoryAwareBatch| -> anyhow::Result<()> {
            w.fetch_add(batch.len() as u64, Ordering::SeqCst);
            Ok(())
        },
        move |marker: &CheckpointMarker| e.lock().unwrap().push(marker.clone()),
        256,
    );

    let handles: Vec<_> = (0..4u64)
        .map(|p| {
            let enqueue = manager.enqueue();
            thread::spawn(move || {
                let stream = StreamDescriptor::new(format!("s{p}"));
                for seq in 0..50 {
                    enqueue.add_record(&stream, encode(p, seq), 16).unwrap();
                    if seq % 10 == 9 {
                        enqueue
                            .add_state(
                                CheckpointMarker::stream(stream.clone(), json!({"p": p, "seq": seq})),
                                16,
                            )
                            .unwrap();
                    }
                }
            })
        })
        .collect();

    for _ in 0..5 {
        flusher.flush_all().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    flusher.flush_all().unwrap();

    assert_eq!(written.load(Ordering::SeqCst), 200);
    let emitted = emitted.lock().unwrap();
    assert_eq!(emitted.len(), 20);
    let mut keys: Vec<(u64, u64)> = emitted
        .iter()
        .map(|m| (m.data["p"].as_u64().unwrap(), m.data["seq"].as_u64().unwrap()))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 20);
    assert_eq!(manager.tracker().pending_count().unwrap(), 0);
}
