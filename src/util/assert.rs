//! Fatal invariant checks for the sync core.

const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Aborts when a sync-core invariant no longer holds: a tagged operation with
/// no view to route to, a write id stacked below an already-recorded one, a
/// prune label placed under a kept subtree, persistence enabled twice.
///
/// Once one of these states is reached the sync-point tree and its caches can
/// no longer be trusted, so there is nothing sensible to recover. Storage and
/// listen failures are different: those travel as `DatabaseResult` values and
/// degrade gracefully.
pub fn hard_assert(invariant_holds: bool, invariant: impl AsRef<str>) {
    if invariant_holds {
        return;
    }
    panic!(
        "firebase-database-core ({SDK_VERSION}) INTERNAL ASSERT FAILED: {}",
        invariant.as_ref()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED: tag points at a view that is gone")]
    fn broken_invariant_aborts_with_its_description() {
        hard_assert(false, "tag points at a view that is gone");
    }

    #[test]
    fn holding_invariant_is_silent() {
        hard_assert(true, "write ids are monotonic");
    }
}
