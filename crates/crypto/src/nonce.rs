//! Sliding-window nonce replay cache.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

/// Tracks `(sender, nonce)` pairs inside a sliding time window.
///
/// A pair observed twice within the window is a replay. Entries age out as
/// the window slides; senders with no live entries are dropped entirely.
#[derive(Debug)]
pub struct NonceCache {
    window_ms: u64,
    inner: Mutex<HashMap<String, SenderNonces>>,
}

#[derive(Debug, Default)]
struct SenderNonces {
    seen: HashSet<String>,
    order: VecDeque<(u64, String)>,
}

impl NonceCache {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Records the nonce if it is fresh. Returns `false` on a replay.
    pub fn observe(&self, sender: &str, nonce: &str, now_ms: u64) -> bool {
        let mut map = self.inner.lock();
        let entry = map.entry(sender.to_owned()).or_default();

        let horizon = now_ms.saturating_sub(self.window_ms);
        while let Some((ts, _)) = entry.order.front() {
            if *ts >= horizon {
                break;
            }
            let (_, expired) = entry.order.pop_front().expect("front checked");
            entry.seen.remove(&expired);
        }

        if !entry.seen.insert(nonce.to_owned()) {
            return false;
        }
        entry.order.push_back((now_ms, nonce.to_owned()));
        true
    }
}
