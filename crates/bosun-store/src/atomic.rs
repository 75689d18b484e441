// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Atomic JSON record persistence.
//!
//! Records are written to a sibling temp file and renamed into place, so
//! readers only ever observe a complete file. Output is pretty-printed with
//! sorted keys (serialization goes through `serde_json::Value`, whose maps
//! are ordered) and owner-only write permissions.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let as_value = serde_json::to_value(value).context("serializing record")?;
    let text = serde_json::to_string_pretty(&as_value)?;

    let tmp = tmp_path(path);
    std::fs::write(&tmp, &text).with_context(|| format!("writing {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("decoding {}", path.display()))
}

/// Every `*.json` file in `dir`. An absent directory is an empty listing,
/// not an error.
pub fn list_json_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
        .collect()
}

/// Decode every record in `dir`, logging and skipping files that fail.
pub fn load_all<T: DeserializeOwned>(dir: &Path) -> Vec<T> {
    let mut records = Vec::new();
    for path in list_json_files(dir) {
        match read_json(&path) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), "skipping unreadable record: {e:#}"),
        }
    }
    records
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
