// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! User-authored skill files appended to the chat system prompt.
//!
//! A skill is a markdown file under `<base>/skills/`. The daemon's only
//! contract with them is this function: the sorted concatenation of their
//! contents, separated by blank lines. Authoring, syncing, and editing the
//! files is out of scope.

use std::path::Path;

use tracing::{debug, warn};

/// Concatenate every `*.md` file in `dir`, sorted by file name.
///
/// A missing directory or an empty one yields an empty string. Files that
/// cannot be read are skipped with a warning so one bad file does not take
/// down the whole system prompt.
pub fn load_skills(dir: &Path) -> String {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return String::new(),
    };

    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("md"))
        .collect();
    files.sort();

    let mut out = String::new();
    for path in files {
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(trimmed);
            }
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable skill file: {e}");
            }
        }
    }
    if !out.is_empty() {
        debug!(chars = out.len(), "loaded skills");
    }
    out
}
