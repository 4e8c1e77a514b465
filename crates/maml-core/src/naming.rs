//! Scope-name counters for parameter naming.
//!
//! Every model instantiation gets a unique scope (`mlp_0`, `mlp_1`, ...).
//! The counters are an explicit value owned by whoever builds models, so
//! two independent builders never see each other's names.

use std::collections::HashMap;

/// Per-prefix counters handing out unique scope names.
///
/// # Example
///
/// ```
/// use maml_core::NameCounters;
///
/// let mut counters = NameCounters::new();
/// assert_eq!(counters.next_name("dense"), "dense_0");
/// assert_eq!(counters.next_name("dense"), "dense_1");
/// assert_eq!(counters.next_name("conv"), "conv_0");
/// ```
#[derive(Debug, Clone, Default)]
pub struct NameCounters {
    counts: HashMap<String, usize>,
}

impl NameCounters {
    /// Creates an empty set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `"{prefix}_{n}"` and advances the counter for `prefix`.
    pub fn next_name(&mut self, prefix: &str) -> String {
        let count = self.counts.entry(prefix.to_string()).or_insert(0);
        let name = format!("{prefix}_{count}");
        *count += 1;
        name
    }

    /// Number of names handed out for `prefix` so far.
    pub fn count(&self, prefix: &str) -> usize {
        self.counts.get(prefix).copied().unwrap_or(0)
    }

    /// Forgets every counter.
    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separate_instances_do_not_share_state() {
        let mut a = NameCounters::new();
        let mut b = NameCounters::new();
        assert_eq!(a.next_name("mlp"), "mlp_0");
        assert_eq!(a.next_name("mlp"), "mlp_1");
        assert_eq!(b.next_name("mlp"), "mlp_0");
    }

    #[test]
    fn reset_restarts_numbering() {
        let mut c = NameCounters::new();
        c.next_name("x");
        c.next_name("x");
        assert_eq!(c.count("x"), 2);
        c.reset();
        assert_eq!(c.count("x"), 0);
        assert_eq!(c.next_name("x"), "x_0");
    }
}
