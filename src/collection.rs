use crossbeam_channel::Receiver;
use std::collections::HashSet;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ImageCache, Pinned};
use crate::loader::{DecodedImage, LoadEvent, LoadRequest, Loader, WorkType};

/// Logical identity of an image in the cache.
pub fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Indices within `radius` of `current`, clamped to the collection.
pub fn window(len: usize, current: usize, radius: usize) -> Range<usize> {
    if len == 0 {
        return 0..0;
    }
    let current = current.min(len - 1);
    current.saturating_sub(radius)..(current + radius + 1).min(len)
}

/// Order in which to load the window: current first, then the immediate
/// neighbours, then two forward for every one backward.
pub fn prefetch_order(len: usize, current: usize, radius: usize) -> Vec<usize> {
    let range = window(len, current, radius);
    if range.is_empty() {
        return Vec::new();
    }
    let current = current.min(len - 1);
    let mut fwd = current + 1..range.end;
    let mut bwd = (range.start..current).rev();

    let mut order = vec![current];
    order.extend(fwd.next());
    order.extend(bwd.next());
    loop {
        let before = order.len();
        order.extend(fwd.by_ref().take(2));
        order.extend(bwd.next());
        if order.len() == before {
            break;
        }
    }
    order
}

// ---------------------------------------------------------------------------
// Collection controller
// ---------------------------------------------------------------------------

/// Ordered list of images plus the loader feeding their cache. Moving the
/// current index trims the cache to the window around it and queues whatever
/// in that window is missing.
#[derive(Debug)]
pub struct Collection {
    files: Vec<PathBuf>,
    keys: Vec<String>,
    loader: Loader,
    radius: usize,
    kind: WorkType,
    current: usize,
}

impl Collection {
    pub fn new(files: Vec<PathBuf>, loader: Loader, radius: usize, kind: WorkType) -> Self {
        let keys = files.iter().map(|p| cache_key(p)).collect();
        Self {
            files,
            keys,
            loader,
            radius,
            kind,
            current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn current_key(&self) -> Option<&str> {
        self.keys.get(self.current).map(String::as_str)
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        self.loader.cache()
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Move to `idx` (clamped). Evicts everything outside the new window and
    /// returns how many entries were evicted.
    ///
    /// Blocks while another thread holds a reservation on an evicted entry.
    /// A pin held by the calling thread on such an entry deadlocks, so drop
    /// pins before moving.
    pub fn set_current(&mut self, idx: usize) -> usize {
        if self.files.is_empty() {
            return 0;
        }
        let new_idx = idx.min(self.files.len() - 1);
        let keep: HashSet<String> = window(self.files.len(), new_idx, self.radius)
            .map(|i| self.keys[i].clone())
            .collect();

        // Stop the loader first so nothing outside the window lands after the trim.
        self.loader.retain_pending(&keep);
        let trimmed = self.cache().trim_to(&keep);

        let mut queued = 0;
        for i in prefetch_order(self.files.len(), new_idx, self.radius) {
            let req = LoadRequest {
                key: self.keys[i].clone(),
                path: self.files[i].clone(),
                kind: self.kind,
            };
            if self.loader.request(req) {
                queued += 1;
            }
        }

        log::debug!(
            "[nav] move {} -> {} (cache_hit={}, trimmed={}, queued={})",
            self.current,
            new_idx,
            self.cache().contains(&self.keys[new_idx]),
            trimmed,
            queued
        );
        self.current = new_idx;
        trimmed
    }

    /// Wait for the current image to land in the cache and pin it. Returns
    /// `None` if it failed to decode or nothing arrived within `timeout`.
    pub fn wait_current(
        &self,
        events: &Receiver<LoadEvent>,
        timeout: Duration,
    ) -> Option<Pinned<DecodedImage>> {
        let key = self.current_key()?;
        loop {
            if let Some(pinned) = self.cache().pin(key) {
                return Some(pinned);
            }
            if self.loader.has_failed(key) {
                return None;
            }
            if events.recv_timeout(timeout).is_err() {
                log::warn!("Timed out waiting for {}", key);
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_clamped() {
        assert_eq!(window(0, 0, 3), 0..0);
        assert_eq!(window(10, 0, 3), 0..4);
        assert_eq!(window(10, 5, 3), 2..9);
        assert_eq!(window(10, 9, 3), 6..10);
        assert_eq!(window(10, 42, 1), 8..10);
        assert_eq!(window(10, 4, 0), 4..5);
    }

    #[test]
    fn prefetch_prefers_forward() {
        assert_eq!(prefetch_order(10, 5, 3), vec![5, 6, 4, 7, 8, 3, 2]);
        assert_eq!(prefetch_order(10, 0, 2), vec![0, 1, 2]);
        assert_eq!(prefetch_order(10, 9, 2), vec![9, 8, 7]);
        assert!(prefetch_order(0, 0, 2).is_empty());
    }

    #[test]
    fn prefetch_covers_window_exactly_once() {
        let mut order = prefetch_order(50, 20, 6);
        order.sort();
        assert_eq!(order, window(50, 20, 6).collect::<Vec<_>>());
    }
}
