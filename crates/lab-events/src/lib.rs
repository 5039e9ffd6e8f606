// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The gateway's normalized view of the raw ACP envelope stream.
//!
//! Three layers, each deterministic given a sequence prefix:
//!
//! 1. [`domain`] — the `{type, sequence, data}` event taxonomy and the
//!    content-part union shared by server projections and clients.
//! 2. [`translate`] — per-session envelope → domain-event translation.
//! 3. [`accumulate`] — the replay accumulator that folds events into a
//!    message list, idempotent under prefix re-feed so history replay and
//!    live streaming produce byte-identical output.
//!
//! [`PARSER_VERSION`] stamps replay checkpoints; bump it whenever the
//! accumulator's output for an existing stream can change, so clients
//! discard stale checkpoints and replay from scratch.

pub mod accumulate;
pub mod domain;
pub mod translate;

pub use accumulate::{ReplayAccumulator, SessionMessagesProjector};
pub use domain::{ContentPart, DomainEvent, Item, ItemKind, Message, Role, ToolCallStatus};
pub use translate::EventTranslator;

/// Version of the replay semantics. Checkpoints written by any other
/// version are rejected and the client replays in full.
pub const PARSER_VERSION: u32 = 3;
