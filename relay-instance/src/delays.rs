//! Delayed resends: the sorted queue and per-request backoff.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;

use relay_mtproto::request::RequestId;

/// Transient-error backoff cap.
pub const MAX_TRANSIENT_DELAY_SECS: u32 = 60;

// ─── Delayed queue ───────────────────────────────────────────────────────────

/// `(request_id, send_at)` entries sorted by ascending `send_at`, no
/// duplicate ids.  The head entry drives a single shared timer.
#[derive(Default)]
pub struct DelayedQueue {
    entries: VecDeque<(RequestId, Instant)>,
}

impl DelayedQueue {
    /// Insert keeping sort order.  Returns `false` when the request is
    /// already queued (the first occurrence wins).
    pub fn insert(&mut self, request_id: RequestId, send_at: Instant) -> bool {
        if self.contains(request_id) {
            return false;
        }
        let position = self
            .entries
            .iter()
            .position(|&(_, at)| at > send_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, (request_id, send_at));
        true
    }

    /// Insert immediately before `anchor`'s entry, sharing its `send_at`.
    /// Returns `false` when the anchor is not queued; an already-queued
    /// request counts as inserted.
    pub fn insert_before(&mut self, request_id: RequestId, anchor: RequestId) -> bool {
        if self.contains(request_id) {
            return true;
        }
        match self.entries.iter().position(|&(id, _)| id == anchor) {
            Some(position) => {
                let send_at = self.entries[position].1;
                self.entries.insert(position, (request_id, send_at));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries.iter().any(|&(id, _)| id == request_id)
    }

    /// Pop the head if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<RequestId> {
        match self.entries.front() {
            Some(&(_, at)) if at <= now => self.entries.pop_front().map(|(id, _)| id),
            _ => None,
        }
    }

    /// When the head entry wants to fire, if any.
    pub fn head_at(&self) -> Option<Instant> {
        self.entries.front().map(|&(_, at)| at)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Per-request backoff for 5xx and negative codes: 1 s doubling up to
/// [`MAX_TRANSIENT_DELAY_SECS`].
#[derive(Default)]
pub struct RequestDelays {
    delays: HashMap<RequestId, u32>,
}

impl RequestDelays {
    /// The delay to apply to this failure, advancing the counter.
    pub fn next(&mut self, request_id: RequestId) -> u32 {
        match self.delays.get_mut(&request_id) {
            Some(delay) => {
                if *delay < MAX_TRANSIENT_DELAY_SECS {
                    *delay *= 2;
                }
                (*delay).min(MAX_TRANSIENT_DELAY_SECS)
            }
            None => {
                self.delays.insert(request_id, 1);
                1
            }
        }
    }

    pub fn forget(&mut self, request_id: RequestId) {
        self.delays.remove(&request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut delays = RequestDelays::default();
        let observed: Vec<u32> = (0..9).map(|_| delays.next(7)).collect();
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);

        delays.forget(7);
        assert_eq!(delays.next(7), 1);
    }

    #[test]
    fn queue_stays_sorted_and_deduplicated() {
        let now = Instant::now();
        let mut queue = DelayedQueue::default();

        assert!(queue.insert(1, now + Duration::from_secs(5)));
        assert!(queue.insert(2, now + Duration::from_secs(1)));
        assert!(queue.insert(3, now + Duration::from_secs(3)));
        assert!(!queue.insert(2, now + Duration::from_secs(9)), "first occurrence wins");
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), Some(2));
        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), Some(3));
        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_due_respects_deadline() {
        let now = Instant::now();
        let mut queue = DelayedQueue::default();
        queue.insert(1, now + Duration::from_secs(2));
        assert_eq!(queue.pop_due(now), None);
        assert_eq!(queue.head_at(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn insert_before_shares_anchor_time() {
        let now = Instant::now();
        let mut queue = DelayedQueue::default();
        queue.insert(10, now + Duration::from_secs(4));
        queue.insert(20, now + Duration::from_secs(8));

        assert!(queue.insert_before(15, 20));
        assert!(queue.insert_before(15, 20), "already queued counts as inserted");
        assert!(!queue.insert_before(99, 1234), "missing anchor");

        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), Some(10));
        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), Some(15));
        assert_eq!(queue.pop_due(now + Duration::from_secs(10)), Some(20));
    }
}
