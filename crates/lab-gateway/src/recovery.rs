// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Send-with-recovery.
//!
//! `POST /messages` runs through here: ensure the session exists, apply the
//! model, forward the message — each phase under its own timeout. When a
//! failure matches the fixed recoverable set the agent session is torn down
//! (subprocess destroyed, persisted agent session id cleared) and the whole
//! chain retries from scratch, at most three attempts. Anything outside the
//! set, and the final attempt, propagate unchanged.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use lab_store::SessionDirectory;

use crate::{manager::AgentSessionManager, GatewayError};

/// Error-message fragments that justify a reset-and-retry. Matching is
/// case-insensitive substring.
const RECOVERABLE_PATTERNS: &[&str] = &[
    "status 500",
    "agent process exited",
    "no session for server",
    "process stdin not available",
    "timed out",
    "no conversation found",
    "session not found",
    "session did not end in result",
    "processtransport is not ready for writing",
];

pub fn is_recoverable(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    RECOVERABLE_PATTERNS.iter().any(|p| message.contains(p))
}

const MAX_ATTEMPTS: u32 = 3;

/// Knobs for one send.
pub struct SendOptions {
    pub model: Option<String>,
    pub phase_timeout: Duration,
}

/// Deliver `message` to the session's agent, recovering from transient
/// transport failures by resetting the agent session.
pub async fn send_with_recovery(
    manager: &Arc<AgentSessionManager>,
    directory: &SessionDirectory,
    session_id: &str,
    message: &str,
    opts: SendOptions,
) -> Result<(), GatewayError> {
    let mut user_emitted = false;

    for attempt in 1..=MAX_ATTEMPTS {
        let result = attempt_send(manager, session_id, message, &opts, &mut user_emitted).await;

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                let recoverable = is_recoverable(&e.to_string());
                if !recoverable || attempt == MAX_ATTEMPTS {
                    return Err(e);
                }
                warn!(
                    %session_id,
                    attempt,
                    "send failed ({e}); resetting agent session and retrying"
                );
                manager.destroy_session(session_id).await;
                if let Err(e) = directory.set_agent_session_id(session_id, None).await {
                    warn!(%session_id, "could not clear agent session id: {e}");
                }
            }
        }
    }
    unreachable!("loop returns on success or final attempt")
}

async fn attempt_send(
    manager: &Arc<AgentSessionManager>,
    session_id: &str,
    message: &str,
    opts: &SendOptions,
    user_emitted: &mut bool,
) -> Result<(), GatewayError> {
    phase(opts.phase_timeout, "ensure session", async {
        manager.create_session(session_id, opts.model.clone()).await
    })
    .await?;

    if let Some(model) = &opts.model {
        phase(opts.phase_timeout, "set model", async {
            manager.set_session_model(session_id, model).await
        })
        .await?;
    }

    // The synthetic user message is emitted inside send_message; once any
    // attempt has reached that point the text is in the pipeline and a
    // retry must not duplicate it.
    let emit_user = !*user_emitted;
    *user_emitted = true;
    let sent = phase(opts.phase_timeout, "send message", async {
        manager.send_message(session_id, message, emit_user).await
    })
    .await;
    if sent.is_ok() {
        info!(%session_id, "message dispatched to agent");
    }
    sent
}

async fn phase<T>(
    timeout: Duration,
    name: &'static str,
    fut: impl std::future::Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::PhaseTimeout { phase: name, secs: timeout.as_secs() }),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_enumerated_pattern_is_recoverable() {
        for message in [
            "Request failed with status 500",
            "agent process exited",
            "no session for server lab-1",
            "process stdin not available",
            "request prompt timed out after 120s",
            "No conversation found with the given id",
            "Session not found: agt-9",
            "session did not end in result",
            "ProcessTransport is not ready for writing",
        ] {
            assert!(is_recoverable(message), "should be recoverable: {message}");
        }
    }

    #[test]
    fn unrelated_errors_are_not_recoverable() {
        for message in [
            "invalid params",
            "permission denied",
            "agent error -32000: model overloaded",
            "workspace dir: read-only file system",
        ] {
            assert!(!is_recoverable(message), "must not be recoverable: {message}");
        }
    }

    #[test]
    fn phase_timeout_message_is_itself_recoverable() {
        let e = GatewayError::PhaseTimeout { phase: "send message", secs: 45 };
        assert!(is_recoverable(&e.to_string()));
    }

    #[tokio::test]
    async fn phase_times_out() {
        let result: Result<(), _> = phase(Duration::from_millis(20), "stall", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result {
            Err(GatewayError::PhaseTimeout { phase, .. }) => assert_eq!(phase, "stall"),
            other => panic!("expected phase timeout, got {other:?}"),
        }
    }
}
