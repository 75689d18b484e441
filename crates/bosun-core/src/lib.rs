// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The chat turn engine.

mod engine;

pub use engine::{ChatEngine, MAX_TURNS};
