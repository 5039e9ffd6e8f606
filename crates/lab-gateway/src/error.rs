// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Gateway-level failures.
///
/// Several `Display` strings here are matched by the send-with-recovery
/// classifier (see [`crate::recovery`]); keep them stable.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no session for server {0}")]
    NoSession(String),

    #[error("no agent is configured")]
    NoAgent,

    #[error("session did not end in result")]
    NoResult,

    #[error("{phase} timed out after {secs}s")]
    PhaseTimeout { phase: &'static str, secs: u64 },

    #[error(transparent)]
    Acp(#[from] lab_acp::AcpError),

    #[error(transparent)]
    Store(#[from] lab_store::StoreError),

    #[error("{0}")]
    Internal(String),
}
