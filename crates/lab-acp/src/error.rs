// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors crossing the ACP transport boundary.
///
/// The `Display` strings are part of the gateway's recovery contract: the
/// send-with-recovery classifier matches on them, so changing a message here
/// changes which failures are retried.
#[derive(Debug, Error)]
pub enum AcpError {
    #[error("request {method} timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    #[error("agent error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("agent process exited")]
    ProcessExited,

    #[error("process stdin not available")]
    StdinUnavailable,

    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("malformed agent reply: {0}")]
    InvalidReply(String),
}

impl AcpError {
    /// True when the transport itself is gone (as opposed to the agent
    /// answering with a JSON-RPC error).
    pub fn is_fatal_transport(&self) -> bool {
        matches!(
            self,
            AcpError::Timeout { .. } | AcpError::ProcessExited | AcpError::StdinUnavailable
        )
    }
}
