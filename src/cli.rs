use clap::Parser;
use ivcache::loader::WorkType;
use std::path::PathBuf;

pub const HELP_ENV: &str = "\
Logging:
  RUST_LOG=info   : Per-image progress and totals
  RUST_LOG=debug  : Cache trims, queued loads and decode timings
";

/// Walks a set of images the way a viewer steps through a folder: the cache is
/// trimmed to a window around the current image while decode workers fill it.
#[derive(Parser)]
#[command(name = "ivcache", about = "Image cache walker", after_help = HELP_ENV)]
pub struct Cli {
    /// Files or directories to walk
    #[arg(required_unless_present = "file_list")]
    pub paths: Vec<PathBuf>,

    /// Load file list from a text file (one path per line)
    #[arg(short = 'L', long, value_name = "FILE")]
    pub file_list: Option<PathBuf>,

    /// Recurse into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Follow symbolic links (default: false)
    #[arg(long)]
    pub follow_links: bool,

    /// Images kept cached on each side of the current one
    #[arg(long, default_value = "3")]
    pub radius: usize,

    /// Decode worker threads. Default: available parallelism, clamped to 4..=16
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,

    /// Cache thumbnails of this size (px) instead of full images
    #[arg(long, value_name = "PX")]
    pub thumbnail: Option<u32>,

    /// Decode every image up front on the rayon pool before walking
    #[arg(long)]
    pub preload: bool,

    /// Pause between steps in milliseconds (default: 0)
    #[arg(long, default_value = "0")]
    pub step_delay: u64,

    /// Give up on an image after this many milliseconds without progress
    #[arg(long, default_value = "10000")]
    pub timeout: u64,
}

impl Cli {
    pub fn work_type(&self) -> WorkType {
        match self.thumbnail {
            Some(px) => WorkType::Thumbnail(px.max(1)),
            None => WorkType::Full,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.unwrap_or_else(default_threads)
    }
}

pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(4, 16)
}
