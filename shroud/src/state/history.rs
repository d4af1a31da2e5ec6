// shroud/src/state/history.rs
//
// Time-windowed record of self-generated activity timestamps.
//
// Ordering: ascending, except that a decorrelation pass deliberately leaves
// the trailing `recent_count` entries shuffled. Pruning therefore filters
// with retain() instead of popping from the front, and readers that need
// chronological order sort their own copy.
//
// Growth is bounded only by retention pruning, which runs on every read and
// on every append.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::events::Millis;

#[derive(Debug, Clone)]
pub struct TimingHistory {
    entries:      Vec<Millis>,
    retention_ms: Millis,
}

impl TimingHistory {
    pub fn new(retention_ms: u64) -> Self {
        Self { entries: Vec::new(), retention_ms: retention_ms as Millis }
    }

    pub fn set_retention(&mut self, retention_ms: u64) {
        self.retention_ms = retention_ms as Millis;
    }

    pub fn record(&mut self, ts: Millis) {
        self.prune(ts);
        self.entries.push(ts);
    }

    pub fn prune(&mut self, now: Millis) {
        let retention = self.retention_ms;
        self.entries.retain(|&t| now - t < retention);
    }

    /// Entries with `now - t < window_ms`, in stored order.
    pub fn snapshot(&mut self, now: Millis, window_ms: Millis) -> Vec<Millis> {
        self.prune(now);
        self.entries.iter().copied().filter(|&t| now - t < window_ms).collect()
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn entries(&self) -> &[Millis] { &self.entries }

    pub fn clear(&mut self) { self.entries.clear(); }

    // ── Poisoning hooks ───────────────────────────────────────────────────────

    /// Merge synthetic timestamps in chronological position. Existing entries
    /// keep their relative order, so a previously shuffled tail stays shuffled.
    pub fn inject_noise(&mut self, noise: impl IntoIterator<Item = Millis>) {
        let mut noise: Vec<Millis> = noise.into_iter().collect();
        if noise.is_empty() { return; }
        noise.sort_unstable();

        let existing = std::mem::take(&mut self.entries);
        let mut merged = Vec::with_capacity(existing.len() + noise.len());
        let mut pending = noise.into_iter().peekable();
        for t in existing {
            while let Some(n) = pending.next_if(|n| *n <= t) {
                merged.push(n);
            }
            merged.push(t);
        }
        merged.extend(pending);
        self.entries = merged;
    }

    /// Fisher–Yates over the trailing `recent_count` entries. Earlier entries
    /// are untouched. Returns how many entries were in the shuffled slice.
    pub fn decorrelate_tail<R: Rng + ?Sized>(&mut self, recent_count: usize, rng: &mut R) -> usize {
        let start = self.entries.len().saturating_sub(recent_count);
        let tail  = &mut self.entries[start..];
        tail.shuffle(rng);
        tail.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn prune_drops_entries_outside_retention() {
        let mut h = TimingHistory::new(1_000);
        h.record(0);
        h.record(500);
        h.record(999);
        h.prune(1_500);
        assert_eq!(h.entries(), &[999]);
    }

    #[test]
    fn snapshot_filters_by_window_and_prunes() {
        let mut h = TimingHistory::new(10_000);
        for t in [0, 2_000, 4_000, 6_000, 8_000] { h.record(t); }
        assert_eq!(h.snapshot(9_000, 5_000), vec![6_000, 8_000]);
        // 0 falls out of retention once now reaches 10_000
        h.snapshot(10_000, 1);
        assert_eq!(h.len(), 4);
    }

    #[test]
    fn noise_is_merged_in_order() {
        let mut h = TimingHistory::new(60_000);
        for t in [100, 300, 500] { h.record(t); }
        h.inject_noise([50, 400, 250]);
        assert_eq!(h.entries(), &[50, 100, 250, 300, 400, 500]);
    }

    #[test]
    fn noise_merge_preserves_a_shuffled_tail() {
        let mut h = TimingHistory::new(1_000_000);
        for t in 0..20 { h.record(t * 100); }
        h.decorrelate_tail(10, &mut StdRng::seed_from_u64(9));
        let shuffled = h.entries().to_vec();

        h.inject_noise([50, 1_450, 5_000, -10]);

        assert_eq!(h.len(), 24);
        let originals: Vec<Millis> = h.entries().iter().copied().filter(|t| shuffled.contains(t)).collect();
        assert_eq!(originals, shuffled);
        assert_eq!(&h.entries()[..3], &[-10, 0, 50]);
        assert_eq!(h.entries()[23], 5_000);
    }

    #[test]
    fn decorrelation_only_touches_the_tail() {
        let mut h = TimingHistory::new(1_000_000);
        for t in 0..20 { h.record(t * 100); }
        let before = h.entries().to_vec();

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(h.decorrelate_tail(10, &mut rng), 10);

        assert_eq!(&h.entries()[..10], &before[..10]);
        let mut tail = h.entries()[10..].to_vec();
        tail.sort_unstable();
        assert_eq!(tail, &before[10..]);
    }

    #[test]
    fn decorrelation_on_short_history_shuffles_everything_available() {
        let mut h = TimingHistory::new(1_000_000);
        for t in [1, 2, 3] { h.record(t); }
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(h.decorrelate_tail(10, &mut rng), 3);
        assert_eq!(h.len(), 3);
    }
}
