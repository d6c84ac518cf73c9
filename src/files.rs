use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::Instant;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tga", "tiff", "tif", "webp", "ico", "pnm", "pbm",
    "pgm", "ppm", "pam", "dds", "hdr", "exr", "ff", "qoi",
];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_skipped_link(path: &Path, follow_links: bool) -> bool {
    !follow_links
        && fs::symlink_metadata(path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
}

/// Gather image paths: entries of `file_list` first, then `paths` in order.
/// Directories are scanned with each directory's files sorted.
pub fn collect_images(
    paths: &[PathBuf],
    file_list: Option<&Path>,
    recursive: bool,
    follow_links: bool,
) -> io::Result<Vec<PathBuf>> {
    log::info!("Starting image scan...");
    let start_time = Instant::now();
    let mut found = Vec::new();

    // 1. Read from file list if provided
    if let Some(list_path) = file_list {
        let reader = io::BufReader::new(fs::File::open(list_path)?);
        for line in reader.lines() {
            found.extend(
                parse_list_line(&line?)
                    .into_iter()
                    .filter(|p| !is_skipped_link(p, follow_links)),
            );
        }
    }

    // 2. Scan explicit paths
    for path in paths {
        if is_skipped_link(path, follow_links) {
            continue;
        }
        if path.is_dir() {
            scan_dir(path, recursive, follow_links, &mut found);
        } else if path.is_file() && is_image_file(path) {
            found.push(path.clone());
        }
    }

    log::info!(
        "Scan complete in {:.2}s. Found {} images.",
        start_time.elapsed().as_secs_f64(),
        found.len()
    );
    Ok(found)
}

/// Columns are separated by tabs or double spaces; a column that is not an
/// existing file is retried split on any whitespace.
fn parse_list_line(line: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for column in line.split('\t').flat_map(|part| part.split("  ")) {
        let trimmed = column.trim();
        if trimmed.is_empty() {
            continue;
        }
        let p = PathBuf::from(trimmed);
        if p.is_file() {
            if is_image_file(&p) {
                out.push(p);
            }
        } else {
            out.extend(
                trimmed
                    .split_whitespace()
                    .map(PathBuf::from)
                    .filter(|sub| sub.is_file() && is_image_file(sub)),
            );
        }
    }
    out
}

fn scan_dir(dir: &Path, recursive: bool, follow_links: bool, dest: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    let mut files = Vec::new();
    let mut subdirs = Vec::new();

    for entry in entries.filter_map(|e| e.ok()) {
        let Ok(ft) = entry.file_type() else { continue };
        if ft.is_symlink() && !follow_links {
            continue;
        }

        let p = entry.path();
        if p.is_file() && is_image_file(&p) {
            files.push(p);
        } else if recursive && p.is_dir() {
            subdirs.push(p);
        }
    }

    files.sort();
    if !files.is_empty() {
        log::debug!("Scanning {:?}... ({} images)", dir, files.len());
        dest.extend(files);
    }

    if recursive {
        subdirs.sort();
        for sub in subdirs {
            scan_dir(&sub, true, follow_links, dest);
        }
    }
}
