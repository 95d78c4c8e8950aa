//! Heartbeat bookkeeping and reconnect scheduling.
//!
//! Both tables are pure state keyed by peer id with caller-supplied clocks
//! (milliseconds); the node drives them from its heartbeat, sweep and
//! reconnect workers.

use crate::identity::PeerId;
use crate::lock;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub peer_id: PeerId,
    pub last_heartbeat_time: u64,
    /// Heartbeat intervals elapsed since the last one arrived
    pub missed_count: u32,
}

#[derive(Default)]
struct Liveness {
    records: HashMap<PeerId, HeartbeatRecord>,
    /// Declared dead and not heard from since
    dead: HashSet<PeerId>,
}

pub struct HeartbeatTracker {
    state: Mutex<Liveness>,
    interval_ms: u64,
    timeout_ms: u64,
}

impl HeartbeatTracker {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(Liveness::default()),
            interval_ms: (interval.as_millis() as u64).max(1),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Start tracking a freshly connected peer.
    pub fn track(&self, peer_id: &str, now: u64) {
        lock(&self.state).records.insert(
            peer_id.to_string(),
            HeartbeatRecord { peer_id: peer_id.to_string(), last_heartbeat_time: now, missed_count: 0 },
        );
    }

    /// Returns true when the peer had been declared dead.
    pub fn record_heartbeat(&self, peer_id: &str, now: u64) -> bool {
        let mut state = lock(&self.state);
        let revived = state.dead.remove(peer_id);
        let record = state.records.entry(peer_id.to_string()).or_insert_with(|| HeartbeatRecord {
            peer_id: peer_id.to_string(),
            last_heartbeat_time: now,
            missed_count: 0,
        });
        record.last_heartbeat_time = record.last_heartbeat_time.max(now);
        record.missed_count = 0;
        revived
    }

    /// Peers silent for at least the timeout. Each is reported once and
    /// removed from tracking.
    pub fn sweep(&self, now: u64) -> Vec<PeerId> {
        let mut state = lock(&self.state);
        let mut dead = Vec::new();
        for record in state.records.values_mut() {
            let silent = now.saturating_sub(record.last_heartbeat_time);
            record.missed_count = (silent / self.interval_ms) as u32;
            if silent >= self.timeout_ms {
                dead.push(record.peer_id.clone());
            }
        }
        for peer_id in &dead {
            state.records.remove(peer_id);
            state.dead.insert(peer_id.clone());
        }
        dead.sort();
        dead
    }

    pub fn is_alive(&self, peer_id: &str, now: u64) -> bool {
        lock(&self.state)
            .records
            .get(peer_id)
            .is_some_and(|r| now.saturating_sub(r.last_heartbeat_time) < self.timeout_ms)
    }

    /// Stop tracking, e.g. after a disconnect. A dead marker is kept so the
    /// first heartbeat on a new connection reports the peer alive again.
    pub fn forget(&self, peer_id: &str) {
        lock(&self.state).records.remove(peer_id);
    }

    /// Drop every trace of the peer.
    pub fn purge(&self, peer_id: &str) {
        let mut state = lock(&self.state);
        state.records.remove(peer_id);
        state.dead.remove(peer_id);
    }

    pub fn record(&self, peer_id: &str) -> Option<HeartbeatRecord> {
        lock(&self.state).records.get(peer_id).cloned()
    }
}

/// Exponential delay: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Another attempt scheduled after this delay
    Retry(Duration),
    /// Attempt ceiling reached; the peer left the set
    Exhausted(u32),
}

#[derive(Debug, Clone)]
struct ReconnectEntry {
    attempts: u32,
    next_at: u64,
}

/// Peers waiting to be redialled.
pub struct ReconnectSet {
    entries: Mutex<HashMap<PeerId, ReconnectEntry>>,
    backoff: Backoff,
}

impl ReconnectSet {
    pub fn new(backoff: Backoff) -> Self {
        Self { entries: Mutex::new(HashMap::new()), backoff }
    }

    /// Schedule a peer; a peer already in the set keeps its progress.
    pub fn schedule(&self, peer_id: &str, now: u64) {
        let first = now + self.backoff.delay(1).as_millis() as u64;
        lock(&self.entries)
            .entry(peer_id.to_string())
            .or_insert(ReconnectEntry { attempts: 0, next_at: first });
    }

    /// Peers whose next attempt is due, in id order.
    pub fn due(&self, now: u64) -> Vec<PeerId> {
        let mut out: Vec<_> = lock(&self.entries)
            .iter()
            .filter(|(_, e)| e.next_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    pub fn record_failure(&self, peer_id: &str, now: u64) -> RetryOutcome {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(peer_id) else {
            return RetryOutcome::Exhausted(0);
        };
        entry.attempts += 1;
        if entry.attempts >= self.backoff.max_attempts {
            let attempts = entry.attempts;
            entries.remove(peer_id);
            return RetryOutcome::Exhausted(attempts);
        }
        let delay = self.backoff.delay(entry.attempts + 1);
        entry.next_at = now + delay.as_millis() as u64;
        RetryOutcome::Retry(delay)
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        lock(&self.entries).remove(peer_id).is_some()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        lock(&self.entries).contains_key(peer_id)
    }

    pub fn attempts(&self, peer_id: &str) -> Option<u32> {
        lock(&self.entries).get(peer_id).map(|e| e.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HeartbeatTracker {
        HeartbeatTracker::new(Duration::from_secs(5), Duration::from_secs(15))
    }

    #[test]
    fn silent_peer_is_reported_dead_exactly_once() {
        let hb = tracker();
        hb.track("b", 0);
        assert!(hb.sweep(14_999).is_empty());
        assert_eq!(hb.record("b").unwrap().missed_count, 2);

        assert_eq!(hb.sweep(15_000), vec!["b".to_string()]);
        assert!(hb.sweep(16_000).is_empty());
        assert!(hb.sweep(60_000).is_empty());
        assert!(!hb.is_alive("b", 60_000));
    }

    #[test]
    fn heartbeat_after_death_revives_once() {
        let hb = tracker();
        hb.track("b", 0);
        assert_eq!(hb.sweep(20_000).len(), 1);

        assert!(hb.record_heartbeat("b", 21_000));
        assert!(hb.is_alive("b", 21_000));
        assert!(!hb.record_heartbeat("b", 22_000));
    }

    #[test]
    fn heartbeats_keep_a_peer_alive() {
        let hb = tracker();
        hb.track("b", 0);
        for t in (5_000..=60_000).step_by(5_000) {
            assert!(!hb.record_heartbeat("b", t));
            assert!(hb.sweep(t + 1).is_empty());
        }
    }

    #[test]
    fn forgetting_keeps_the_dead_marker_until_purge() {
        let hb = tracker();
        hb.track("b", 0);
        hb.sweep(15_000);
        hb.track("b", 16_000);
        hb.forget("b");
        assert!(hb.record("b").is_none());
        assert!(hb.record_heartbeat("b", 17_000));

        hb.sweep(40_000);
        hb.purge("b");
        assert!(!hb.record_heartbeat("b", 41_000));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let b = Backoff { base: Duration::from_secs(2), max: Duration::from_secs(60), max_attempts: 5 };
        let delays: Vec<_> = (1..=7).map(|n| b.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(b.delay(100), Duration::from_secs(60));
    }

    #[test]
    fn reconnect_gives_up_after_max_attempts() {
        let set = ReconnectSet::new(Backoff {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            max_attempts: 3,
        });
        set.schedule("b", 0);
        assert!(set.due(1_999).is_empty());
        assert_eq!(set.due(2_000), vec!["b".to_string()]);

        assert_eq!(set.record_failure("b", 2_000), RetryOutcome::Retry(Duration::from_secs(4)));
        assert!(set.due(5_999).is_empty());
        assert_eq!(set.record_failure("b", 6_000), RetryOutcome::Retry(Duration::from_secs(8)));
        assert_eq!(set.record_failure("b", 14_000), RetryOutcome::Exhausted(3));
        assert!(!set.contains("b"));
    }

    #[test]
    fn rescheduling_keeps_progress() {
        let set = ReconnectSet::new(Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_attempts: 5,
        });
        set.schedule("b", 0);
        set.record_failure("b", 1_000);
        set.schedule("b", 1_500);
        assert_eq!(set.attempts("b"), Some(1));
        assert!(set.remove("b"));
        assert!(!set.remove("b"));
    }
}
