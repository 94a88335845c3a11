//! Cross-sensor vote registry.
//!
//! Every sensor bound to a cooling device holds exactly one vote (its latest
//! combined request); the device's effective state is the maximum vote. The
//! registry keeps an ordered multiset per device so the max is always one
//! lookup away, and applies each remove+insert atomically under a single
//! write guard.

use std::collections::BTreeMap;
use std::sync::RwLock;

use indexmap::IndexMap;

#[derive(Debug, Default)]
pub struct CdevVoteRegistry {
    /// Per device: vote value -> number of sensors currently holding it.
    votes: RwLock<IndexMap<String, BTreeMap<i32, u32>>>,
}

impl CdevVoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one voter for `cdev`, starting at state 0. Called once per
    /// (sensor, device) pair at registration; the entry persists for the
    /// process lifetime.
    pub fn register_voter(&self, cdev: &str) {
        let mut votes = self.votes.write().unwrap();
        let device_votes = votes.entry(cdev.to_string()).or_default();
        *device_votes.entry(0).or_insert(0) += 1;
    }

    /// Replace one voter's vote for `cdev`. Returns whether the device's max
    /// vote changed, decided under the same guard as the update.
    pub fn update_vote(&self, cdev: &str, old: i32, new: i32) -> bool {
        let mut votes = self.votes.write().unwrap();
        let Some(device_votes) = votes.get_mut(cdev) else {
            return false;
        };

        let prev_max = device_votes.keys().next_back().copied();

        if let Some(count) = device_votes.get_mut(&old) {
            *count -= 1;
            if *count == 0 {
                device_votes.remove(&old);
            }
        }
        *device_votes.entry(new).or_insert(0) += 1;

        let new_max = device_votes.keys().next_back().copied();
        prev_max != new_max
    }

    /// Current max vote for `cdev`, or `None` if no sensor is bound to it.
    #[must_use]
    pub fn max_request(&self, cdev: &str) -> Option<i32> {
        let votes = self.votes.read().unwrap();
        votes
            .get(cdev)
            .and_then(|device_votes| device_votes.keys().next_back().copied())
    }
}
