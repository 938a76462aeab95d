//! Build-definition template lookup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Names tried for `name`: the name itself, then with trailing `-segment`s
/// stripped one at a time (`grub2-efi-image` → `grub2-efi` → `grub2`).
pub fn candidate_names(name: &str) -> Vec<&str> {
    let mut out = vec![name];
    let mut current = name;
    while let Some((head, _)) = current.rsplit_once('-') {
        if head.is_empty() {
            break;
        }
        out.push(head);
        current = head;
    }
    out
}

/// Find the template for package `name` under `spec_dir`.
///
/// Sub-packages have no template of their own, so an exact match is preferred
/// and prefix-stripped names are the fallback. Returns `None` when nothing
/// matches or `spec_dir` does not exist.
pub fn find_template(spec_dir: &Path, name: &str) -> Option<PathBuf> {
    if !spec_dir.is_dir() {
        warn!(dir = %spec_dir.display(), "template directory missing");
        return None;
    }

    // First occurrence in sorted walk order wins.
    let mut by_stem: BTreeMap<String, PathBuf> = BTreeMap::new();
    for entry in WalkDir::new(spec_dir).sort_by_file_name() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let is_spec = path.extension().map(|e| e == "spec").unwrap_or(false);
        if !entry.file_type().is_file() || !is_spec {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            by_stem
                .entry(stem.to_string())
                .or_insert_with(|| path.to_path_buf());
        }
    }

    for candidate in candidate_names(name) {
        if let Some(path) = by_stem.get(candidate) {
            if candidate != name {
                debug!(package = name, template = %path.display(), "using parent template");
            }
            return Some(path.clone());
        }
    }
    None
}
