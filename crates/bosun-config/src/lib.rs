// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Base directory layout, credentials, and skill loading for the daemon.
//!
//! Everything bosun persists lives under a single hidden directory in the
//! user's home (`~/.bosun` by default, overridable for tests and via the
//! `--base-dir` CLI flag). Records are one JSON file per id; the
//! subdirectories are created eagerly at startup so the stores can assume
//! they exist.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

mod skills;

pub use skills::load_skills;

/// Environment variable holding the LLM API key.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Resolved filesystem layout of the daemon's state directory.
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Layout rooted at the default location, `~/.bosun`.
    pub fn default_base() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self::at(home.join(".bosun")))
    }

    /// Layout rooted at an explicit directory (tests, `--base-dir`).
    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.base.join("conversations")
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.base.join("workflows")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.base.join("executions")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.base.join("skills")
    }

    pub fn env_file(&self) -> PathBuf {
        self.base.join(".env")
    }

    /// MCP server configuration, `{mcpServers: {name -> {command, args, env, url}}}`.
    pub fn mcp_servers_file(&self) -> PathBuf {
        self.base.join("mcp_servers.json")
    }

    /// Create the base directory and every record subdirectory.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [
            self.base.clone(),
            self.conversations_dir(),
            self.workflows_dir(),
            self.executions_dir(),
            self.skills_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Resolve the LLM API key.
///
/// The process environment wins; otherwise the optional `.env` file in the
/// base directory is loaded and the environment is consulted again. Returns
/// `None` when no key is configured — chat turns then fail with a clear
/// error envelope rather than at startup.
pub fn api_key(paths: &Paths) -> Option<String> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            return Some(key);
        }
    }
    let env_file = paths.env_file();
    if env_file.is_file() {
        debug!(path = %env_file.display(), "loading .env");
        if let Err(e) = dotenvy::from_path(&env_file) {
            warn!(path = %env_file.display(), "failed to load .env: {e}");
        }
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_base() {
        let paths = Paths::at("/tmp/bosun-test");
        assert_eq!(
            paths.conversations_dir(),
            PathBuf::from("/tmp/bosun-test/conversations")
        );
        assert_eq!(
            paths.mcp_servers_file(),
            PathBuf::from("/tmp/bosun-test/mcp_servers.json")
        );
    }

    #[test]
    fn ensure_layout_creates_all_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::at(tmp.path().join("state"));
        paths.ensure_layout().unwrap();
        assert!(paths.conversations_dir().is_dir());
        assert!(paths.workflows_dir().is_dir());
        assert!(paths.executions_dir().is_dir());
        assert!(paths.skills_dir().is_dir());
    }

    #[test]
    fn ensure_layout_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::at(tmp.path());
        paths.ensure_layout().unwrap();
        paths.ensure_layout().unwrap();
        assert!(paths.skills_dir().is_dir());
    }
}
