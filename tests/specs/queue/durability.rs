// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable queue round-trip: unacked leases survive a reopen and are
//! redelivered first, in offset order.

use serde_json::json;
use tm_core::TaskEnvelope;
use tm_storage::{FileWorkQueue, WorkQueue};

fn envelope(idx: i64) -> TaskEnvelope {
    TaskEnvelope::new("demo", json!({"idx": idx}), None, None, 0.0)
}

#[test]
fn reopened_queue_redelivers_unacked_offsets_first() {
    let dir = tempfile::tempdir().unwrap();

    let mut queue = FileWorkQueue::open(dir.path(), 1_000_000).unwrap();
    for idx in 0..10 {
        queue.put(&envelope(idx)).unwrap();
    }

    let leased = queue.lease(4, 60_000).unwrap();
    assert_eq!(
        leased.iter().map(|t| t.offset).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    for task in &leased[..2] {
        queue.ack(task.offset, &task.token).unwrap();
    }
    queue.close().unwrap();
    drop(queue);

    let mut reopened = FileWorkQueue::open(dir.path(), 1_000_000).unwrap();
    let recovered = reopened.lease(10, 60_000).unwrap();
    let offsets: Vec<u64> = recovered.iter().map(|t| t.offset).collect();

    // The two unacked leases come back first, then the rest in offset order
    assert_eq!(&offsets[..2], &[2, 3]);
    assert_eq!(offsets, (2..10).collect::<Vec<u64>>());
}

#[test]
fn no_task_is_lost_or_duplicated_across_states() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = FileWorkQueue::open(dir.path(), 1_000_000).unwrap();

    let total = 20;
    for idx in 0..total {
        queue.put(&envelope(idx)).unwrap();
    }

    let mut acked = 0usize;
    let mut seen = std::collections::HashSet::new();
    loop {
        let leases = queue.lease(7, 60_000).unwrap();
        if leases.is_empty() {
            break;
        }
        for lease in leases {
            assert!(seen.insert(lease.offset), "offset leased twice");
            queue.ack(lease.offset, &lease.token).unwrap();
            acked += 1;
        }
    }

    assert_eq!(acked, total as usize);
    assert_eq!(queue.pending_count(), 0);
}
