// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Daemon composition root, exposed as a library so integration tests can
//! run the full stack in-process.

pub mod cli;
pub mod daemon;

pub use daemon::Daemon;
