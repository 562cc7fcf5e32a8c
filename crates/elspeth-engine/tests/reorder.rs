// elspeth-engine/tests/reorder.rs
// ============================================================================
// Module: Reorder Buffer Tests
// Description: Tests for FIFO release, backpressure, eviction, and shutdown.
// ============================================================================
//! ## Overview
//! Validates that release order equals submission order for arbitrary
//! completion interleavings, that backpressure bounds in-flight rows, that
//! eviction skips gaps, and that shutdown wakes every waiter.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use elspeth_engine::ReorderError;
use elspeth_engine::RowReorderBuffer;
use proptest::prelude::*;

// ============================================================================
// SECTION: FIFO Ordering
// ============================================================================

/// Tests that out-of-order completions release in submission order.
#[test]
fn test_release_order_equals_submission_order() {
    let buffer: RowReorderBuffer<u64> = RowReorderBuffer::new(10, "test");
    let tickets: Vec<_> =
        (0..5).map(|i| buffer.submit(&format!("row-{i}"), None).unwrap()).collect();

    // Complete in reverse order.
    for ticket in tickets.iter().rev() {
        buffer.complete(ticket, ticket.sequence * 10).unwrap();
    }

    for expected in 0..5_u64 {
        let entry = buffer.wait_for_next_release(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(entry.sequence, expected);
        assert_eq!(entry.result, expected * 10);
        assert_eq!(entry.row_id, format!("row-{expected}"));
    }
}

/// Tests that the release side blocks until the head sequence completes.
#[test]
fn test_release_blocks_on_incomplete_head() {
    let buffer: RowReorderBuffer<&'static str> = RowReorderBuffer::new(10, "test");
    let first = buffer.submit("a", None).unwrap();
    let second = buffer.submit("b", None).unwrap();
    buffer.complete(&second, "b-done").unwrap();

    // Head (sequence 0) is incomplete: release times out.
    let err = buffer.wait_for_next_release(Some(Duration::from_millis(50))).unwrap_err();
    assert!(matches!(err, ReorderError::Timeout(_)));

    buffer.complete(&first, "a-done").unwrap();
    let entry = buffer.wait_for_next_release(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(entry.result, "a-done");
}

// ============================================================================
// SECTION: Backpressure
// ============================================================================

/// Tests that submission blocks at max_pending and resumes after release.
#[test]
fn test_backpressure_bounds_pending() {
    let buffer: Arc<RowReorderBuffer<u32>> = Arc::new(RowReorderBuffer::new(2, "test"));
    let t0 = buffer.submit("r0", None).unwrap();
    let _t1 = buffer.submit("r1", None).unwrap();
    assert_eq!(buffer.pending_count(), 2);

    // Third submit must time out while the buffer is full.
    let err = buffer.submit("r2", Some(Duration::from_millis(50))).unwrap_err();
    assert!(matches!(err, ReorderError::Timeout(_)));

    // Release one slot, then a blocked submitter gets through.
    let releaser = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        releaser.complete(&t0, 0).unwrap();
        releaser.wait_for_next_release(Some(Duration::from_secs(1))).unwrap()
    });
    let ticket = buffer.submit("r2", Some(Duration::from_secs(1))).unwrap();
    assert_eq!(ticket.row_id, "r2");
    handle.join().unwrap();
    assert!(buffer.pending_count() <= 2);
}

// ============================================================================
// SECTION: Eviction
// ============================================================================

/// Tests that evicting a stuck head lets later sequences release.
#[test]
fn test_evict_skips_gap() {
    let buffer: RowReorderBuffer<&'static str> = RowReorderBuffer::new(10, "test");
    let stuck = buffer.submit("stuck", None).unwrap();
    let retry = buffer.submit("retry", None).unwrap();
    buffer.complete(&retry, "retried").unwrap();

    assert!(buffer.evict(&stuck).unwrap());
    let entry = buffer.wait_for_next_release(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(entry.sequence, retry.sequence);
    assert_eq!(entry.result, "retried");
}

/// Tests that eviction refuses completed or unknown tickets.
#[test]
fn test_evict_refuses_completed_and_unknown() {
    let buffer: RowReorderBuffer<u8> = RowReorderBuffer::new(4, "test");
    let ticket = buffer.submit("done", None).unwrap();
    buffer.complete(&ticket, 1).unwrap();
    assert!(!buffer.evict(&ticket).unwrap());

    let entry = buffer.wait_for_next_release(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(entry.result, 1);
    // Released tickets are unknown to evict.
    assert!(!buffer.evict(&ticket).unwrap());
}

/// Tests that completing an evicted or duplicate ticket is refused.
#[test]
fn test_complete_validation() {
    let buffer: RowReorderBuffer<u8> = RowReorderBuffer::new(4, "test");
    let ticket = buffer.submit("once", None).unwrap();
    buffer.complete(&ticket, 7).unwrap();
    assert!(matches!(
        buffer.complete(&ticket, 8).unwrap_err(),
        ReorderError::AlreadyCompleted { .. }
    ));

    let evicted = buffer.submit("evicted", None).unwrap();
    buffer.evict(&evicted).unwrap();
    assert!(matches!(
        buffer.complete(&evicted, 9).unwrap_err(),
        ReorderError::UnknownTicket { .. }
    ));
}

// ============================================================================
// SECTION: Shutdown
// ============================================================================

/// Tests that shutdown wakes blocked waiters with a shutdown error.
#[test]
fn test_shutdown_wakes_waiters() {
    let buffer: Arc<RowReorderBuffer<u8>> = Arc::new(RowReorderBuffer::new(4, "test"));
    let waiter = Arc::clone(&buffer);
    let handle =
        thread::spawn(move || waiter.wait_for_next_release(Some(Duration::from_secs(5))));
    thread::sleep(Duration::from_millis(20));
    buffer.shutdown();
    let outcome = handle.join().unwrap();
    assert!(matches!(outcome.unwrap_err(), ReorderError::Shutdown { .. }));
    assert!(buffer.is_shutdown());
    assert!(matches!(
        buffer.submit("late", None).unwrap_err(),
        ReorderError::Shutdown { .. }
    ));
}

/// Tests the metrics snapshot counters.
#[test]
fn test_metrics_snapshot() {
    let buffer: RowReorderBuffer<u8> = RowReorderBuffer::new(8, "metrics");
    let a = buffer.submit("a", None).unwrap();
    let b = buffer.submit("b", None).unwrap();
    buffer.complete(&b, 2).unwrap();

    let metrics = buffer.metrics().unwrap();
    assert_eq!(metrics.current_pending, 2);
    assert_eq!(metrics.completed_waiting, 1);
    assert_eq!(metrics.total_submitted, 2);
    assert_eq!(metrics.total_released, 0);

    buffer.complete(&a, 1).unwrap();
    buffer.wait_for_next_release(None).unwrap();
    buffer.wait_for_next_release(None).unwrap();
    let metrics = buffer.metrics().unwrap();
    assert_eq!(metrics.total_released, 2);
    assert_eq!(metrics.max_observed_pending, 2);
}

// ============================================================================
// SECTION: Property Tests
// ============================================================================

proptest! {
    /// For any completion permutation, release order equals submission order
    /// and the pending count never exceeds the limit.
    #[test]
    fn prop_fifo_under_arbitrary_completion_order(
        permutation in prop::collection::vec(0_usize..16, 16),
    ) {
        let buffer: RowReorderBuffer<usize> = RowReorderBuffer::new(16, "prop");
        let tickets: Vec<_> = (0..16)
            .map(|i| buffer.submit(&format!("row-{i}"), None).unwrap())
            .collect();

        // Complete in the permuted order (dedup keeps it a valid schedule).
        let mut order: Vec<usize> = permutation;
        order.sort_unstable();
        order.dedup();
        let mut done = vec![false; 16];
        for &index in &order {
            buffer.complete(&tickets[index], index).unwrap();
            done[index] = true;
        }
        for (index, ticket) in tickets.iter().enumerate() {
            if !done[index] {
                buffer.complete(ticket, index).unwrap();
            }
        }

        for expected in 0..16 {
            let entry = buffer.wait_for_next_release(Some(Duration::from_secs(1))).unwrap();
            prop_assert_eq!(entry.sequence, expected as u64);
            prop_assert_eq!(entry.result, expected);
        }
        prop_assert_eq!(buffer.pending_count(), 0);
    }
}
