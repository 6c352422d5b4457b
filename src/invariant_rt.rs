//! RT-safe invariant signaling for the tick and copy paths.
//!
//! RT code **signals facts**. Non-RT code **judges correctness**.
//!
//! A pipeline given a signal queue pushes a one-byte id for every notable event on its
//! task path: a completed copy walk, an applied deferred trigger, an xrun recovery. The
//! push never allocates, locks or panics; a full queue drops the signal. Tests drain the
//! queue and check that the required ids appeared.

use rtrb::{Consumer, Producer, RingBuffer};

/// A pipeline copy walk finished without error.
pub const INV_COPY_COMPLETE: u8 = 1;

/// A deferred trigger command ran on the pipeline task.
pub const INV_TRIGGER_APPLIED: u8 = 2;

/// A copy failure was followed by a successful recovery.
pub const INV_XRUN_RECOVERED: u8 = 3;

/// The pipeline task gave up after a failed recovery.
pub const INV_PIPELINE_FAILED: u8 = 4;

/// The pipeline task waited out one tick of trigger delay.
pub const INV_TRIGGER_DELAYED: u8 = 5;

/// Capacity for invariant signal queue.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Signal producer half, owned by the RT side.
pub type SignalTx = Producer<u8>;
/// Signal consumer half, owned by the verifying side.
pub type SignalRx = Consumer<u8>;

/// Creates a new invariant signal queue pair.
pub fn new_invariant_queue() -> (SignalTx, SignalRx) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signal `id`. Dropped if the queue is full.
#[inline]
pub fn signal_invariant(tx: &mut SignalTx, id: u8) {
    let _ = tx.push(id);
}

/// Drains all pending invariant signals from the queue.
pub fn drain_invariant_signals(rx: &mut SignalRx) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Panics if any of `required` was never signaled.
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();
    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!("RT contract '{contract_name}' missing invariants: {missing:?}. Present: {present:?}");
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_COPY_COMPLETE => "COPY_COMPLETE",
        INV_TRIGGER_APPLIED => "TRIGGER_APPLIED",
        INV_XRUN_RECOVERED => "XRUN_RECOVERED",
        INV_PIPELINE_FAILED => "PIPELINE_FAILED",
        INV_TRIGGER_DELAYED => "TRIGGER_DELAYED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_arrive_in_order() {
        let (mut tx, mut rx) = new_invariant_queue();
        signal_invariant(&mut tx, INV_TRIGGER_APPLIED);
        signal_invariant(&mut tx, INV_COPY_COMPLETE);
        assert_eq!(
            drain_invariant_signals(&mut rx),
            vec![INV_TRIGGER_APPLIED, INV_COPY_COMPLETE]
        );
    }

    #[test]
    fn full_queue_drops() {
        let (mut tx, mut rx) = new_invariant_queue();
        for _ in 0..INVARIANT_QUEUE_CAPACITY + 10 {
            signal_invariant(&mut tx, INV_COPY_COMPLETE);
        }
        let counts = count_invariant_signals(&drain_invariant_signals(&mut rx));
        assert_eq!(counts[INV_COPY_COMPLETE as usize], INVARIANT_QUEUE_CAPACITY);
    }

    #[test]
    #[should_panic(expected = "missing invariants")]
    fn missing_signal_fails_contract() {
        contract_test_rt("recovery", &[INV_COPY_COMPLETE], &[INV_XRUN_RECOVERED]);
    }

    #[test]
    fn names() {
        assert_eq!(invariant_name(INV_XRUN_RECOVERED), "XRUN_RECOVERED");
        assert_eq!(invariant_name(200), "UNKNOWN");
    }
}
