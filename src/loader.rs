use crossbeam_channel::Sender;
use image::GenericImageView;
use rayon::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::cache::ImageCache;
use crate::error::LoadError;

// ---------------------------------------------------------------------------
// Decoded image data (CPU side)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DecodedImage {
    pub rgba_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub format_name: String,
}

impl DecodedImage {
    pub fn mem_size(&self) -> u64 {
        self.rgba_bytes.len() as u64
    }
}

/// Decode `path` to RGBA8, shrinking it to fit `target_size` when given.
pub fn decode_image(path: &Path, target_size: Option<(u32, u32)>) -> Result<DecodedImage, LoadError> {
    let file_size = fs::metadata(path)
        .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?
        .len();
    let img = image::open(path).map_err(|source| LoadError::Decode { path: path.to_path_buf(), source })?;

    let format_name = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("unknown")
        .to_uppercase();

    let final_img = match target_size {
        Some((w, h)) => img.thumbnail(w, h),
        None => img,
    };

    let (width, height) = final_img.dimensions();
    Ok(DecodedImage {
        rgba_bytes: final_img.to_rgba8().into_raw(),
        width,
        height,
        file_size,
        format_name,
    })
}

// ---------------------------------------------------------------------------
// Load requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkType {
    Full,
    /// Bounding box edge in pixels.
    Thumbnail(u32),
}

impl WorkType {
    fn target_size(self) -> Option<(u32, u32)> {
        match self {
            WorkType::Full => None,
            WorkType::Thumbnail(px) => Some((px, px)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub key: String,
    pub path: PathBuf,
    pub kind: WorkType,
}

/// Sent to the consumer side whenever a worker finishes a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadEvent {
    Ready(String),
    Failed { key: String, error: String },
}

// ---------------------------------------------------------------------------
// Job queue (shared between the requester and worker threads via Mutex + Condvar)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Queue {
    pending: VecDeque<LoadRequest>,
    in_flight: HashSet<String>,
    /// In-flight keys dropped from the working set; their results are discarded.
    stale: HashSet<String>,
    failed: HashSet<String>,
    shutdown: bool,
}

impl Queue {
    fn is_known(&self, key: &str) -> bool {
        self.in_flight.contains(key)
            || self.failed.contains(key)
            || self.pending.iter().any(|r| r.key == key)
    }
}

type SharedQueue = Arc<(Mutex<Queue>, Condvar)>;

fn lock_queue(shared: &SharedQueue) -> MutexGuard<'_, Queue> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Background decode workers
// ---------------------------------------------------------------------------

/// Pool of decode threads that populate an [`ImageCache`].
///
/// A key is never decoded twice while it is cached, queued or in flight.
/// Keys that failed to decode are remembered and not retried.
pub struct Loader {
    queue: SharedQueue,
    cache: Arc<ImageCache>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Loader {
    pub fn spawn(cache: Arc<ImageCache>, events: Sender<LoadEvent>, num_threads: usize) -> Self {
        let queue: SharedQueue = Arc::new((Mutex::new(Queue::default()), Condvar::new()));
        let workers = (0..num_threads.max(1))
            .map(|_| {
                let queue = Arc::clone(&queue);
                let cache = Arc::clone(&cache);
                let events = events.clone();
                thread::spawn(move || worker_loop(&queue, &cache, &events))
            })
            .collect();
        log::debug!("Spawned {} decode workers", num_threads.max(1));

        Self { queue, cache, workers }
    }

    /// Queue `req` for decoding. Returns false if it is already cached, queued,
    /// in flight, or failed before.
    pub fn request(&self, req: LoadRequest) -> bool {
        let (_, cvar) = &*self.queue;
        let mut queue = lock_queue(&self.queue);
        if queue.stale.remove(&req.key) {
            // Still in flight; keep its result after all.
            return true;
        }
        if queue.shutdown || queue.is_known(&req.key) || self.cache.contains(&req.key) {
            return false;
        }
        queue.pending.push_back(req);
        cvar.notify_one();
        true
    }

    /// Drop queued requests whose key is not in `keep`. Work already in flight
    /// runs to completion but its result is not inserted.
    pub fn retain_pending(&self, keep: &HashSet<String>) {
        let mut queue = lock_queue(&self.queue);
        let before = queue.pending.len();
        queue.pending.retain(|r| keep.contains(&r.key));
        let stale: Vec<String> = queue
            .in_flight
            .iter()
            .filter(|key| !keep.contains(*key))
            .cloned()
            .collect();
        queue.stale.extend(stale);
        let dropped = before - queue.pending.len();
        if dropped > 0 {
            log::debug!("Dropped {} queued loads outside the working set", dropped);
        }
    }

    pub fn pending(&self) -> usize {
        lock_queue(&self.queue).pending.len()
    }

    pub fn has_failed(&self, key: &str) -> bool {
        lock_queue(&self.queue).failed.contains(key)
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        {
            let (_, cvar) = &*self.queue;
            let mut queue = lock_queue(&self.queue);
            queue.shutdown = true;
            queue.pending.clear();
            cvar.notify_all();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Decode worker panicked");
            }
        }
    }
}

fn worker_loop(queue: &SharedQueue, cache: &ImageCache, events: &Sender<LoadEvent>) {
    let (_, cvar) = &**queue;
    loop {
        // Wait for work
        let req = {
            let mut state = lock_queue(queue);
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(req) = state.pending.pop_front() {
                    state.in_flight.insert(req.key.clone());
                    break req;
                }
                state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let result = catch_decode(&req.path, || decode_image(&req.path, req.kind.target_size()));
        if let Some(event) = finish_request(queue, cache, req, result) {
            let _ = events.send(event);
        }
    }
}

/// Run a decode, turning a panic inside the codec into a load failure so the
/// worker survives and the key is not left in flight.
fn catch_decode<F>(path: &Path, decode: F) -> Result<DecodedImage, LoadError>
where
    F: FnOnce() -> Result<DecodedImage, LoadError>,
{
    panic::catch_unwind(AssertUnwindSafe(decode)).unwrap_or_else(|_| {
        Err(LoadError::Panicked {
            path: path.to_path_buf(),
        })
    })
}

/// Record the outcome of an in-flight request and produce the event for it,
/// or `None` if the request went stale and its result was dropped.
fn finish_request(
    queue: &SharedQueue,
    cache: &ImageCache,
    req: LoadRequest,
    result: Result<DecodedImage, LoadError>,
) -> Option<LoadEvent> {
    // Insert under the queue lock so a concurrent retain_pending either
    // sees the entry in the cache or marks it stale first.
    let mut state = lock_queue(queue);
    state.in_flight.remove(&req.key);
    let stale = state.stale.remove(&req.key);
    match result {
        Ok(_) if stale => {
            log::debug!("Discarded {} (left the working set)", req.key);
            None
        }
        Ok(decoded) => {
            log::debug!("Decoded {} ({}x{})", req.key, decoded.width, decoded.height);
            cache.insert(req.key.clone(), Arc::new(decoded));
            Some(LoadEvent::Ready(req.key))
        }
        Err(e) => {
            log::warn!("Could not load {}", e);
            state.failed.insert(req.key.clone());
            Some(LoadEvent::Failed {
                key: req.key,
                error: e.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Bulk preload
// ---------------------------------------------------------------------------

/// Decode every request on the rayon pool and insert the results into `cache`,
/// skipping keys that are already cached. Returns the number of new entries.
pub fn preload(cache: &ImageCache, requests: &[LoadRequest]) -> usize {
    requests
        .par_iter()
        .filter(|req| !cache.contains(&req.key))
        .filter_map(|req| match catch_decode(&req.path, || decode_image(&req.path, req.kind.target_size())) {
            Ok(decoded) => {
                log::debug!("Preloaded {} ({} bytes)", req.key, decoded.mem_size());
                Some(cache.insert(req.key.clone(), Arc::new(decoded)))
            }
            Err(e) => {
                log::warn!("Could not load {}", e);
                None
            }
        })
        .filter(|&inserted| inserted)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        image::RgbaImage::from_pixel(w, h, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();
        path
    }

    fn request(path: &Path, kind: WorkType) -> LoadRequest {
        LoadRequest {
            key: path.to_string_lossy().into_owned(),
            path: path.to_path_buf(),
            kind,
        }
    }

    #[test]
    fn decode_full_and_thumbnail() {
        let dir = TempDir::new().unwrap();
        let path = write_png(dir.path(), "a.png", 64, 32);

        let full = decode_image(&path, None).unwrap();
        assert_eq!((full.width, full.height), (64, 32));
        assert_eq!(full.mem_size(), 64 * 32 * 4);
        assert_eq!(full.format_name, "PNG");

        let thumb = decode_image(&path, Some((16, 16))).unwrap();
        assert_eq!((thumb.width, thumb.height), (16, 8));
    }

    #[test]
    fn decode_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = decode_image(&dir.path().join("missing.png"), None).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn decode_garbage_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.png");
        fs::write(&path, b"not a png").unwrap();
        let err = decode_image(&path, None).unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
    }

    #[test]
    fn workers_populate_cache_once() {
        let dir = TempDir::new().unwrap();
        let path = write_png(dir.path(), "a.png", 8, 8);
        let cache = Arc::new(ImageCache::new());
        let (tx, rx) = unbounded();
        let loader = Loader::spawn(Arc::clone(&cache), tx, 2);

        let req = request(&path, WorkType::Full);
        assert!(loader.request(req.clone()));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(10)).unwrap(),
            LoadEvent::Ready(req.key.clone())
        );
        assert!(cache.contains(&req.key));

        // Already cached: not queued again.
        assert!(!loader.request(req));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn failed_keys_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.png");
        fs::write(&path, b"garbage").unwrap();
        let cache = Arc::new(ImageCache::new());
        let (tx, rx) = unbounded();
        let loader = Loader::spawn(Arc::clone(&cache), tx, 1);

        let req = request(&path, WorkType::Full);
        assert!(loader.request(req.clone()));
        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            LoadEvent::Failed { key, .. } => assert_eq!(key, req.key),
            other => panic!("unexpected {:?}", other),
        }
        assert!(loader.has_failed(&req.key));
        assert!(!loader.request(req));
        assert!(cache.is_empty());
    }

    fn decoded(w: u32, h: u32) -> DecodedImage {
        DecodedImage {
            rgba_bytes: vec![0; (w * h * 4) as usize],
            width: w,
            height: h,
            file_size: 0,
            format_name: "PNG".to_string(),
        }
    }

    /// Mark `req` as picked up by a worker without running one.
    fn start_in_flight(loader: &Loader, req: &LoadRequest) {
        lock_queue(&loader.queue).in_flight.insert(req.key.clone());
    }

    #[test]
    fn stale_result_is_discarded() {
        let cache = Arc::new(ImageCache::new());
        let (tx, rx) = unbounded();
        let loader = Loader::spawn(Arc::clone(&cache), tx, 1);
        let req = request(Path::new("a.png"), WorkType::Full);

        start_in_flight(&loader, &req);
        loader.retain_pending(&HashSet::new());
        assert!(lock_queue(&loader.queue).stale.contains(&req.key));

        assert_eq!(finish_request(&loader.queue, &cache, req.clone(), Ok(decoded(2, 2))), None);
        assert!(!cache.contains(&req.key));
        assert!(lock_queue(&loader.queue).in_flight.is_empty());
        assert!(lock_queue(&loader.queue).stale.is_empty());
        assert!(rx.try_recv().is_err());

        // Nothing left behind: the key can be requested afresh.
        assert!(!loader.has_failed(&req.key));
    }

    #[test]
    fn re_request_keeps_stale_result() {
        let cache = Arc::new(ImageCache::new());
        let (tx, _rx) = unbounded();
        let loader = Loader::spawn(Arc::clone(&cache), tx, 1);
        let req = request(Path::new("a.png"), WorkType::Full);

        start_in_flight(&loader, &req);
        loader.retain_pending(&HashSet::new());
        assert!(loader.request(req.clone()));
        assert_eq!(loader.pending(), 0);

        assert_eq!(
            finish_request(&loader.queue, &cache, req.clone(), Ok(decoded(2, 2))),
            Some(LoadEvent::Ready(req.key.clone()))
        );
        assert!(cache.contains(&req.key));
    }

    #[test]
    fn retain_keeps_wanted_in_flight_work() {
        let cache = Arc::new(ImageCache::new());
        let (tx, _rx) = unbounded();
        let loader = Loader::spawn(Arc::clone(&cache), tx, 1);
        let kept = request(Path::new("kept.png"), WorkType::Full);

        start_in_flight(&loader, &kept);
        loader.retain_pending(&HashSet::from([kept.key.clone()]));
        assert!(lock_queue(&loader.queue).stale.is_empty());

        finish_request(&loader.queue, &cache, kept.clone(), Ok(decoded(1, 1)));
        assert!(cache.contains(&kept.key));
    }

    #[test]
    fn panicking_decode_becomes_failure() {
        let path = Path::new("boom.png");
        let result = catch_decode(path, || panic!("codec bug"));
        assert!(matches!(result, Err(LoadError::Panicked { .. })));

        let cache = Arc::new(ImageCache::new());
        let (tx, _rx) = unbounded();
        let loader = Loader::spawn(Arc::clone(&cache), tx, 1);
        let req = request(path, WorkType::Full);
        start_in_flight(&loader, &req);

        let event = finish_request(&loader.queue, &cache, req.clone(), result);
        assert!(matches!(event, Some(LoadEvent::Failed { .. })));
        assert!(loader.has_failed(&req.key));
        assert!(lock_queue(&loader.queue).in_flight.is_empty());
    }

    #[test]
    fn preload_inserts_new_entries_only() {
        let dir = TempDir::new().unwrap();
        let requests: Vec<LoadRequest> = (0..4)
            .map(|i| request(&write_png(dir.path(), &format!("{i}.png"), 4, 4), WorkType::Thumbnail(2)))
            .collect();
        let cache = ImageCache::new();

        assert_eq!(preload(&cache, &requests[..2]), 2);
        assert_eq!(preload(&cache, &requests), 2);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.mem_size(), 4 * 2 * 2 * 4);
    }
}
