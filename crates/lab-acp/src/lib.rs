// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! ACP (Agent Client Protocol) plumbing.
//!
//! The agent subprocess speaks JSON-RPC 2.0 as newline-delimited UTF-8 JSON
//! over stdio.  This crate owns everything below the session layer:
//!
//! - [`envelope`] — helpers over the raw `serde_json::Value` envelopes plus
//!   the synthetic envelopes the gateway injects into the event stream.
//! - [`connection`] — the framed request/response/notification channel,
//!   generic over `AsyncRead`/`AsyncWrite` so tests can drive it in-memory.
//! - [`agent`] — the subprocess handle (spawn, stderr drain, graceful stop).
//! - [`client`] — handlers for the requests the *agent* makes back to us:
//!   permission prompts, `fs/*` and `terminal/*`.

pub mod agent;
pub mod client;
pub mod connection;
pub mod envelope;
mod error;
pub mod terminal;

pub use agent::{AcpAgent, SpawnSpec};
pub use client::GatewayClientHandler;
pub use connection::{AcpConnection, ClientHandler, RpcError};
pub use error::AcpError;
