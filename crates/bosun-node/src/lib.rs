// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket layer: JSON envelopes in, engine events out.
//!
//! [`Hub`] accepts any number of clients, decodes inbound [`Envelope`]s and
//! hands them to the single registered [`MessageHandler`]. Outbound
//! delivery is per-client serialized with a send timeout; a slow client is
//! dropped rather than allowed to stall a broadcast. Components that only
//! need to emit events depend on the [`EventSink`] seam, not on the hub
//! itself.

pub mod envelope;
pub mod hub;

pub use envelope::Envelope;
pub use hub::{EventSink, Hub, MessageHandler, SEND_TIMEOUT};
