//! Bounded-cardinality cost telemetry.

use std::collections::{HashMap, VecDeque};

/// Keeps a full-resolution total per label but exports at most `k` labels.
///
/// Promotion is greedy: a label that is not exported replaces an exported series once its total
/// exceeds the smallest exported value. The series it displaces is the longest-exported one it
/// outranks, so long-lived series rotate out before recently promoted ones.
#[derive(Clone, Debug)]
pub struct TopKCounter {
    k: usize,
    totals: HashMap<String, f64>,
    // Promotion order, oldest first.
    exported: VecDeque<(String, f64)>,
}

impl TopKCounter {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            totals: HashMap::new(),
            exported: VecDeque::with_capacity(k),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn increment(&mut self, label: &str, amount: f64) {
        if !amount.is_finite() {
            return;
        }
        let total = self.totals.entry(label.to_string()).or_insert(0.0);
        *total += amount;
        let total = *total;

        if let Some(slot) = self.exported.iter_mut().find(|(name, _)| name == label) {
            slot.1 = total;
            return;
        }
        if self.exported.len() < self.k {
            self.exported.push_back((label.to_string(), total));
            return;
        }
        let min = self
            .exported
            .iter()
            .map(|(_, value)| *value)
            .fold(f64::INFINITY, f64::min);
        if total <= min {
            return;
        }
        if let Some(pos) = self.exported.iter().position(|(_, value)| *value < total) {
            if let Some((evicted, _)) = self.exported.remove(pos) {
                tracing::trace!(label = %evicted, "evicted from exported top-k");
            }
            self.exported.push_back((label.to_string(), total));
        }
    }

    pub fn total(&self, label: &str) -> Option<f64> {
        self.totals.get(label).copied()
    }

    /// Exported series, largest first.
    pub fn exported(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self.exported.iter().cloned().collect();
        out.sort_by(|(a_label, a), (b_label, b)| {
            b.total_cmp(a).then_with(|| a_label.cmp(b_label))
        });
        out
    }

    pub fn is_exported(&self, label: &str) -> bool {
        self.exported.iter().any(|(name, _)| name == label)
    }

    pub fn tracked_labels(&self) -> usize {
        self.totals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_and_evicts_greedily() {
        let mut counter = TopKCounter::new(2);
        counter.increment("a", 1.0);
        counter.increment("b", 5.0);
        counter.increment("c", 3.0);
        counter.increment("a", 10.0);

        assert_eq!(
            counter.exported(),
            vec![("a".to_string(), 11.0), ("c".to_string(), 3.0)]
        );
        assert!(!counter.is_exported("b"));
        assert_eq!(counter.total("b"), Some(5.0));
        assert_eq!(counter.tracked_labels(), 3);
    }

    #[test]
    fn small_totals_are_tracked_but_not_exported() {
        let mut counter = TopKCounter::new(1);
        counter.increment("big", 100.0);
        counter.increment("small", 1.0);
        counter.increment("small", 1.0);
        assert_eq!(counter.exported(), vec![("big".to_string(), 100.0)]);
        assert_eq!(counter.total("small"), Some(2.0));
    }

    #[test]
    fn zero_k_exports_nothing() {
        let mut counter = TopKCounter::new(0);
        counter.increment("a", 1.0);
        assert!(counter.exported().is_empty());
        assert_eq!(counter.total("a"), Some(1.0));
    }
}
