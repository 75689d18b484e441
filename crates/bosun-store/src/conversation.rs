// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable conversation log, one JSON file per conversation id.
//!
//! Loading runs the orphan repair from [`bosun_model::transcript`] so a
//! conversation interrupted mid-tool-call reads back consistent; deleting a
//! conversation deletes its messages with it (they live in the same file).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use bosun_model::{transcript, ChatMessage, ChatRole};

use crate::atomic;

/// Longest auto-derived title, in characters.
const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            created: Utc::now(),
            messages: Vec::new(),
        }
    }

    /// Time of the last message, falling back to creation time; drives the
    /// listing sort order.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(self.created)
    }

    /// Title shown in listings: the stored title, or the trimmed prefix of
    /// the first user message.
    fn effective_title(&self) -> String {
        if !self.title.trim().is_empty() {
            return self.title.clone();
        }
        self.messages
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.trim().chars().take(TITLE_MAX_CHARS).collect())
            .unwrap_or_default()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist the conversation atomically, deriving the title if empty.
    pub fn save(&self, conversation: &Conversation) -> anyhow::Result<()> {
        let mut record = conversation.clone();
        record.title = record.effective_title();
        atomic::write_json(&self.path_for(&record.id), &record)
    }

    /// Load one conversation, repairing any dangling tool calls. A missing
    /// or undecodable file is an error here (unlike in listings).
    pub fn load(&self, id: &str) -> anyhow::Result<Conversation> {
        let mut conversation: Conversation = atomic::read_json(&self.path_for(id))?;
        let repaired = transcript::repair(&conversation.messages);
        if repaired.len() != conversation.messages.len() {
            warn!(
                conversation = %id,
                added = repaired.len() - conversation.messages.len(),
                "repaired dangling tool calls on load"
            );
            conversation.messages = repaired;
            self.save(&conversation)?;
        }
        Ok(conversation)
    }

    /// All conversations, newest activity first. Undecodable files are
    /// logged and skipped.
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = atomic::load_all(&self.dir);
        conversations.sort_by_key(|c| std::cmp::Reverse(c.last_activity()));
        conversations
    }

    /// Delete the conversation and, with it, every message it owns.
    pub fn delete(&self, id: &str) -> anyhow::Result<()> {
        let path = self.path_for(id);
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
