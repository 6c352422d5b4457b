//! Contract tracking for build-time (non-RT) invariants.
//!
//! Graph construction, plan compilation and pipeline setup record every invariant they
//! check; contract tests then assert that the invariants they rely on were exercised.
//! This path locks and allocates, so nothing on the tick or copy path may call it.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

pub const GRAPH_ACYCLIC: u32 = 1;
pub const GRAPH_REJECTS_INVALID: u32 = 2;
pub const PLAN_TOPOLOGICAL: u32 = 3;
pub const PLAN_COVERS_GRAPH: u32 = 4;
pub const PIPELINE_ENDPOINTS: u32 = 5;
pub const PIPELINE_SCHEDULED: u32 = 6;
pub const CONFIG_VALID: u32 = 7;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

/// Check `condition`, record `id` and panic if it does not hold.
#[cfg(feature = "ppt")]
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full = match context {
            Some(ctx) => format!("invariant {id} failed: {message} ({ctx})"),
            None => format!("invariant {id} failed: {message}"),
        };
        tracing::error!("{full}");
        panic!("{full}");
    }
    INVARIANT_LOG.lock().insert(id);
}

#[cfg(not(feature = "ppt"))]
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("invariant failed: {message}");
    }
}

/// Panic unless every id in `required` was recorded.
#[cfg(feature = "ppt")]
pub fn contract_test(test_name: &str, required: &[u32]) {
    let missing: Vec<u32> = {
        let log = INVARIANT_LOG.lock();
        required.iter().copied().filter(|id| !log.contains(id)).collect()
    };
    if !missing.is_empty() {
        panic!("contract '{test_name}' failed: invariants not checked: {missing:?}");
    }
}

#[cfg(not(feature = "ppt"))]
pub fn contract_test(_test_name: &str, _required: &[u32]) {}

#[cfg(feature = "ppt")]
pub fn clear_invariant_log() {
    INVARIANT_LOG.lock().clear();
}

#[cfg(not(feature = "ppt"))]
pub fn clear_invariant_log() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_check_is_recorded() {
        assert_invariant(CONFIG_VALID, true, "holds", Some("test"));
        contract_test("config", &[CONFIG_VALID]);
    }

    #[test]
    #[should_panic(expected = "invariant 3 failed")]
    fn failing_check_panics() {
        assert_invariant(PLAN_TOPOLOGICAL, false, "broken", None);
    }
}
