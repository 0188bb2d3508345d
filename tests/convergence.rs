//! Convergence tests for the replicated text store.
//!
//! The core guarantee: any set of replicas that has seen the same set of
//! operations materializes the same text, regardless of delivery order.

use cowrite::comments::{resolve_anchor, AnchorPoint};
use cowrite::crdt::{ApplyOutcome, Operation, StateVector, TextCrdt};
use uuid::Uuid;

fn replica(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

/// Small xorshift for reproducible shuffles without an RNG dependency.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = (self.next() % (i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }
}

#[test]
fn concurrent_prefix_inserts_converge_deterministically() {
    let mut a = TextCrdt::new(replica(1));
    let mut b = TextCrdt::new(replica(2));

    let ops_a = a.local_insert(0, "Hello");
    let ops_b = b.local_insert(0, "Hi ");

    a.apply_batch(ops_b.clone());
    b.apply_batch(ops_a.clone());

    assert_eq!(a.materialize(), b.materialize());
    // Each run stays contiguous; the larger replica id wins the head slot.
    assert_eq!(a.materialize(), "Hi Hello");
}

#[test]
fn delivery_order_does_not_matter() {
    let mut seed = 0x1234_5678_9abc_def0u64;

    for round in 0..20 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(round);
        let mut rng = XorShift(seed | 1);

        // Three writers produce interleaved edits.
        let mut writers: Vec<TextCrdt> =
            (1..=3).map(|n| TextCrdt::new(replica(n))).collect();
        let mut all_ops: Vec<Operation> = Vec::new();

        all_ops.extend(writers[0].local_insert(0, "alpha "));
        all_ops.extend(writers[1].local_insert(0, "bravo "));
        all_ops.extend(writers[2].local_insert(0, "charlie "));
        // Writer 0 edits on top of its own text.
        all_ops.extend(writers[0].local_delete(0, 2));
        all_ops.extend(writers[0].local_insert(0, "AL"));

        // Deliver every op to fresh observers in independent random orders.
        let mut texts = Vec::new();
        for _ in 0..4 {
            let mut shuffled = all_ops.clone();
            rng.shuffle(&mut shuffled);

            let mut observer = TextCrdt::new(replica(99));
            observer.apply_batch(shuffled);
            assert_eq!(observer.pending_count(), 0, "all ops must integrate");
            texts.push(observer.materialize().to_string());
        }
        for text in &texts[1..] {
            assert_eq!(text, &texts[0], "divergence with seed {seed:#x}");
        }
    }
}

#[test]
fn reapplying_operations_is_idempotent() {
    let mut source = TextCrdt::new(replica(1));
    let mut ops = source.local_insert(0, "stable");
    ops.extend(source.local_delete(0, 1));

    let mut target = TextCrdt::new(replica(2));
    target.apply_batch(ops.clone());
    let before = target.materialize().to_string();

    for op in ops {
        assert_eq!(target.apply_remote(op), ApplyOutcome::Duplicate);
    }
    assert_eq!(target.materialize(), before);
}

#[test]
fn out_of_order_delivery_buffers_until_causally_ready() {
    let mut source = TextCrdt::new(replica(1));
    let ops = source.local_insert(0, "abc");

    let mut target = TextCrdt::new(replica(2));
    // Deliver the last insert first: its origin is unknown.
    assert_eq!(
        target.apply_remote(ops[2].clone()),
        ApplyOutcome::Buffered
    );
    assert_eq!(target.pending_count(), 1);
    assert_eq!(target.materialize(), "");

    // The middle one is also blocked.
    assert_eq!(
        target.apply_remote(ops[1].clone()),
        ApplyOutcome::Buffered
    );

    // The head unblocks the whole chain transitively.
    assert!(matches!(
        target.apply_remote(ops[0].clone()),
        ApplyOutcome::Applied(_)
    ));
    assert_eq!(target.pending_count(), 0);
    assert_eq!(target.materialize(), "abc");
}

#[test]
fn delete_of_unseen_element_waits_for_the_insert() {
    let mut source = TextCrdt::new(replica(1));
    let inserts = source.local_insert(0, "x");
    let deletes = source.local_delete(0, 1);

    let mut target = TextCrdt::new(replica(2));
    assert_eq!(
        target.apply_remote(deletes[0].clone()),
        ApplyOutcome::Buffered
    );
    target.apply_batch(inserts);
    assert_eq!(target.pending_count(), 0);
    assert_eq!(target.materialize(), "");
}

#[test]
fn delta_sync_transfers_exactly_whats_missing() {
    let mut a = TextCrdt::new(replica(1));
    let mut b = TextCrdt::new(replica(2));

    // Shared history.
    let shared = a.local_insert(0, "common ");
    b.apply_batch(shared);

    // A edits offline.
    a.local_insert(7, "ground");
    a.local_delete(0, 1);

    // B asks with its state vector; A answers with the gap.
    let delta = a.compute_delta(b.state_vector());
    assert!(!delta.is_empty());
    b.apply_batch(delta);

    assert_eq!(a.materialize(), b.materialize());

    // Nothing further to send in either direction.
    assert!(a.compute_delta(b.state_vector()).is_empty());
    assert!(b.compute_delta(a.state_vector()).is_empty());
}

#[test]
fn delta_against_empty_vector_is_full_history() {
    let mut a = TextCrdt::new(replica(1));
    a.local_insert(0, "everything");
    a.local_delete(4, 2);

    let mut fresh = TextCrdt::new(replica(2));
    fresh.apply_batch(a.compute_delta(&StateVector::default()));
    assert_eq!(fresh.materialize(), a.materialize());
}

#[test]
fn concurrent_delete_and_insert_at_same_spot() {
    let mut a = TextCrdt::new(replica(1));
    let mut b = TextCrdt::new(replica(2));

    let base = a.local_insert(0, "abcd");
    b.apply_batch(base);

    // A deletes "bc" while B types inside the doomed range.
    let del = a.local_delete(1, 2);
    let ins = b.local_insert(2, "XY");

    a.apply_batch(ins);
    b.apply_batch(del);

    assert_eq!(a.materialize(), b.materialize());
    // The insert survives the surrounding delete.
    assert!(a.materialize().contains("XY"));
}

#[test]
fn anchors_track_through_concurrent_edits() {
    let mut a = TextCrdt::new(replica(1));
    let mut b = TextCrdt::new(replica(2));

    let base = a.local_insert(0, "hello world");
    b.apply_batch(base);

    // Anchor on the 'w' (position 6).
    let anchor = a.element_id_at(6).unwrap();
    assert_eq!(resolve_anchor(&a, anchor), AnchorPoint::Exact(6));

    // B prepends concurrently; the anchor follows the character.
    let prefix = b.local_insert(0, ">>> ");
    a.apply_batch(prefix);
    assert_eq!(resolve_anchor(&a, anchor), AnchorPoint::Exact(10));

    // Deleting the anchored character degrades to its live predecessor.
    a.local_delete(10, 1);
    match resolve_anchor(&a, anchor) {
        AnchorPoint::Predecessor { pos, .. } => assert_eq!(pos, 9),
        other => panic!("expected predecessor anchor, got {other:?}"),
    }
}

#[test]
fn anchor_degrades_to_start_when_prefix_is_gone() {
    let mut doc = TextCrdt::new(replica(1));
    doc.local_insert(0, "abc");
    let anchor = doc.element_id_at(0).unwrap();

    doc.local_delete(0, 3);
    assert_eq!(resolve_anchor(&doc, anchor), AnchorPoint::Start);
}

#[test]
fn three_way_convergence_with_pairwise_sync() {
    let mut docs: Vec<TextCrdt> = (1..=3).map(|n| TextCrdt::new(replica(n))).collect();

    let mut ops = Vec::new();
    ops.push(docs[0].local_insert(0, "one "));
    ops.push(docs[1].local_insert(0, "two "));
    ops.push(docs[2].local_insert(0, "three "));

    // Full mesh exchange.
    for (i, batch) in ops.into_iter().enumerate() {
        for (j, doc) in docs.iter_mut().enumerate() {
            if i != j {
                doc.apply_batch(batch.clone());
            }
        }
    }

    assert_eq!(docs[0].materialize(), docs[1].materialize());
    assert_eq!(docs[1].materialize(), docs[2].materialize());
    // All three runs intact.
    let text = docs[0].materialize();
    assert!(text.contains("one "));
    assert!(text.contains("two "));
    assert!(text.contains("three "));
}
