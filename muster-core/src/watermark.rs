use std::collections::HashMap;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::MembershipError;
use crate::messages::LinkUpdateMessage;

/// Aggregates per-edge link-status reports into stable view-change batches.
///
/// A subject is delivered if and only if H distinct reports about it have
/// arrived and no other subject currently sits in the open interval (L, H).
/// Holding delivery until the interval drains is what turns correlated
/// failures and joins into a single batch instead of a trickle of
/// single-node proposals.
pub struct WatermarkBuffer {
    h: usize,
    l: usize,
    state: Mutex<BufferState>,
}

struct BufferState {
    counters: HashMap<Endpoint, usize>,
    updates_in_progress: usize,
    ready: Vec<Endpoint>,
    deliver_count: u64,
}

impl WatermarkBuffer {
    const K_MIN: usize = 3;

    /// Creates a buffer with the given ring count and watermarks.
    ///
    /// Fails unless K >= H > L >= 0 and K >= 3.
    pub fn new(k: usize, h: usize, l: usize) -> Result<Self, MembershipError> {
        if k < Self::K_MIN || h > k || h <= l {
            return Err(MembershipError::Configuration(format!(
                "watermarks must satisfy K >= H > L >= 0 with K >= 3 (K: {k}, H: {h}, L: {l})"
            )));
        }
        Ok(Self {
            h,
            l,
            state: Mutex::new(BufferState {
                counters: HashMap::new(),
                updates_in_progress: 0,
                ready: Vec::new(),
                deliver_count: 0,
            }),
        })
    }

    /// Number of stable batches delivered so far.
    #[must_use]
    pub fn deliver_count(&self) -> u64 {
        self.state.lock().deliver_count
    }

    /// Feeds one link-status report and returns the stable batch, if any.
    ///
    /// Each call is an independent increment; duplicate suppression is the
    /// caller's responsibility. The returned batch is an owned snapshot and
    /// the counters of every subject in it have been reset to zero.
    pub fn receive(&self, msg: &LinkUpdateMessage) -> Result<Vec<Endpoint>, MembershipError> {
        let mut state = self.state.lock();

        let counter = state.counters.entry(msg.link_dst.clone()).or_insert(0);
        *counter += 1;
        let value = *counter;

        if value == self.l {
            state.updates_in_progress += 1;
        }

        if value == self.h {
            state.ready.push(msg.link_dst.clone());
            // The in-progress count was only bumped when the counter
            // crossed L; with L = 0 that never happens and every subject
            // delivers as soon as it reaches H.
            if self.l > 0 {
                state.updates_in_progress -= 1;
            }

            if state.updates_in_progress == 0 {
                state.deliver_count += 1;
                let batch: Vec<Endpoint> = state.ready.drain(..).collect();
                for subject in &batch {
                    let Some(counter) = state.counters.get_mut(subject) else {
                        return Err(MembershipError::InvariantViolation(format!(
                            "ready subject {subject} missing from counter map"
                        )));
                    };
                    *counter = 0;
                }
                return Ok(batch);
            }
        }

        Ok(Vec::new())
    }

    /// Discards all aggregation state. Invoked when a new view is installed
    /// so reports from the previous configuration cannot leak across.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.counters.clear();
        state.ready.clear();
        state.updates_in_progress = 0;
    }

    #[cfg(test)]
    fn counter(&self, subject: &Endpoint) -> usize {
        self.state.lock().counters.get(subject).copied().unwrap_or(0)
    }

    #[cfg(test)]
    fn updates_in_progress(&self) -> usize {
        self.state.lock().updates_in_progress
    }
}
