mod cli;

use clap::Parser;
use crossbeam_channel::unbounded;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ivcache::cache::ImageCache;
use ivcache::collection::{Collection, cache_key};
use ivcache::files::collect_images;
use ivcache::loader::{LoadRequest, Loader, preload};

use crate::cli::Cli;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let files = match collect_images(
        &cli.paths,
        cli.file_list.as_deref(),
        cli.recursive,
        cli.follow_links,
    ) {
        Ok(files) => files,
        Err(e) => {
            log::error!("Could not read file list: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if files.is_empty() {
        log::error!("No image files found.");
        return ExitCode::FAILURE;
    }

    let kind = cli.work_type();
    let cache = Arc::new(ImageCache::new());

    if cli.preload {
        let requests: Vec<LoadRequest> = files
            .iter()
            .map(|p| LoadRequest {
                key: cache_key(p),
                path: p.clone(),
                kind,
            })
            .collect();
        let start_time = Instant::now();
        let loaded = preload(&cache, &requests);
        log::info!(
            "Preloaded {} of {} images in {:.2}s ({} bytes).",
            loaded,
            requests.len(),
            start_time.elapsed().as_secs_f64(),
            cache.mem_size()
        );
    }

    let (tx, rx) = unbounded();
    let loader = Loader::spawn(Arc::clone(&cache), tx, cli.num_threads());
    let mut collection = Collection::new(files, loader, cli.radius, kind);

    let step_delay = Duration::from_millis(cli.step_delay);
    let timeout = Duration::from_millis(cli.timeout);
    let start_time = Instant::now();
    let mut shown = 0;
    let mut failed = 0;

    for idx in 0..collection.len() {
        collection.set_current(idx);
        match collection.wait_current(&rx, timeout) {
            Some(img) => {
                log::info!(
                    "[{}/{}] {} {}x{} {} ({} bytes on disk)",
                    idx + 1,
                    collection.len(),
                    img.key(),
                    img.width,
                    img.height,
                    img.format_name,
                    img.file_size
                );
                shown += 1;
            }
            None => failed += 1,
        }
        if !step_delay.is_zero() {
            thread::sleep(step_delay);
        }
    }

    log::info!(
        "Walked {} images in {:.2}s: {} shown, {} failed, {} cached ({} bytes).",
        collection.len(),
        start_time.elapsed().as_secs_f64(),
        shown,
        failed,
        cache.len(),
        cache.mem_size()
    );
    cache.clear();

    ExitCode::SUCCESS
}
