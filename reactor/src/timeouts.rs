use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Identifier of a scheduled timer within a [`TimeoutManager`].
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("timer#{0}")]
pub struct TimerId(u64);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct Entry {
    when: Instant,
    seq: u64,
    id: TimerId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when.cmp(&other.when).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Manages timers and triggers them in deadline order; deadlines which
/// coincide fire in registration order.
pub struct TimeoutManager {
    heap: BinaryHeap<Reverse<Entry>>,
    scheduled: HashSet<TimerId>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
    next_seq: u64,
}

impl Default for TimeoutManager {
    fn default() -> Self { Self::new() }
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            scheduled: empty!(),
            cancelled: empty!(),
            next_id: 0,
            next_seq: 0,
        }
    }

    /// Number of pending (non-cancelled) timers.
    pub fn len(&self) -> usize { self.scheduled.len() }

    pub fn is_empty(&self) -> bool { self.scheduled.is_empty() }

    /// Register a new timer expiring at the given instant.
    pub fn register(&mut self, when: Instant) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { when, seq, id }));
        self.scheduled.insert(id);
        id
    }

    /// Re-arm an already known timer id with a fresh deadline. Used for
    /// recurring timers so the id handed to the caller stays stable.
    pub fn reschedule(&mut self, id: TimerId, when: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { when, seq, id }));
        self.scheduled.insert(id);
        self.cancelled.remove(&id);
    }

    /// Cancel a pending timer. Returns whether the timer was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.scheduled.remove(&id) {
            self.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Time until the nearest pending timer, if any. Returns a zero duration
    /// for timers already overdue.
    pub fn next(&mut self, now: Instant) -> Option<Duration> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.contains(&entry.id) {
                let entry = self.heap.pop().expect("peeked entry").0;
                self.cancelled.remove(&entry.id);
                continue;
            }
            return Some(entry.when.saturating_duration_since(now));
        }
        None
    }

    /// Pop all timers expired by `now` into `woken`, in deadline order, and
    /// return their count.
    pub fn wake(&mut self, now: Instant, woken: &mut Vec<(TimerId, Instant)>) -> usize {
        let mut count = 0;
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.contains(&entry.id) {
                let entry = self.heap.pop().expect("peeked entry").0;
                self.cancelled.remove(&entry.id);
                continue;
            }
            if entry.when > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry").0;
            self.scheduled.remove(&entry.id);
            woken.push((entry.id, entry.when));
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck_macros::quickcheck;

    #[test]
    fn wake_in_order() {
        let mut tm = TimeoutManager::new();
        let now = Instant::now();

        let t8 = tm.register(now + Duration::from_millis(8));
        let t9 = tm.register(now + Duration::from_millis(9));
        let t10 = tm.register(now + Duration::from_millis(10));

        let mut woken = vec![];
        assert_eq!(tm.wake(now, &mut woken), 0);
        assert!(woken.is_empty());
        assert_eq!(tm.len(), 3);

        assert_eq!(tm.wake(now + Duration::from_millis(9), &mut woken), 2);
        assert_eq!(
            woken.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![t8, t9]
        );
        assert_eq!(tm.len(), 1);

        woken.clear();
        assert_eq!(tm.wake(now + Duration::from_millis(100), &mut woken), 1);
        assert_eq!(woken[0].0, t10);
        assert!(tm.is_empty());
    }

    #[test]
    fn same_deadline_fires_in_registration_order() {
        let mut tm = TimeoutManager::new();
        let now = Instant::now();
        let when = now + Duration::from_millis(5);

        let a = tm.register(when);
        let b = tm.register(when);
        let c = tm.register(when);

        let mut woken = vec![];
        tm.wake(when, &mut woken);
        assert_eq!(
            woken.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![a, b, c]
        );
    }

    #[test]
    fn cancelled_timer_never_wakes() {
        let mut tm = TimeoutManager::new();
        let now = Instant::now();

        let a = tm.register(now + Duration::from_millis(1));
        let b = tm.register(now + Duration::from_millis(2));

        assert!(tm.cancel(a));
        assert!(!tm.cancel(a));
        assert_eq!(tm.len(), 1);

        let mut woken = vec![];
        assert_eq!(tm.wake(now + Duration::from_millis(10), &mut woken), 1);
        assert_eq!(woken[0].0, b);
    }

    #[test]
    fn next_skips_cancelled() {
        let mut tm = TimeoutManager::new();
        let now = Instant::now();

        let a = tm.register(now + Duration::from_millis(1));
        tm.register(now + Duration::from_millis(50));
        tm.cancel(a);

        let next = tm.next(now).unwrap();
        assert!(next > Duration::from_millis(10));
        assert_eq!(tm.next(now + Duration::from_millis(60)), Some(Duration::ZERO));
    }

    #[quickcheck]
    fn prop_wake_is_sorted(delays: Vec<u16>) -> bool {
        let mut tm = TimeoutManager::new();
        let now = Instant::now();
        for delay in &delays {
            tm.register(now + Duration::from_millis(*delay as u64));
        }
        let mut woken = vec![];
        tm.wake(now + Duration::from_secs(120), &mut woken);
        woken.len() == delays.len() && woken.windows(2).all(|w| w[0].1 <= w[1].1)
    }
}
