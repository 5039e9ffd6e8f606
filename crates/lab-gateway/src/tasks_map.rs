// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Mapping from task tool invocations to the session task schema.
//!
//! The agent manages its plan through host tools; the gateway mirrors those
//! calls into `session_tasks` so the UI can render a task list without
//! parsing tool envelopes. `TodoWrite` replaces the whole list; `TaskCreate`
//! and `TaskUpdate` touch single rows.

use serde_json::Value;

use lab_store::TaskStatus;

/// What a task tool call means for the stored list.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskToolOp {
    ReplaceAll(Vec<TaskDraft>),
    Upsert(TaskDraft),
}

/// Partial task row extracted from tool input. `None` fields keep whatever
/// the existing row has on upsert.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskDraft {
    pub external_id: Option<String>,
    pub content: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<String>,
    pub position: Option<i64>,
    pub source_tool_name: String,
}

/// Map a normalized tool name (`todowrite`, `taskcreate`, `taskupdate`) and
/// the tool call's `rawInput` to a storage operation. Returns `None` for
/// anything else or for unusable input.
pub fn map_task_tool(tool: &str, raw_input: &Value) -> Option<TaskToolOp> {
    match tool {
        "todowrite" => {
            let todos = raw_input.get("todos")?.as_array()?;
            let drafts = todos
                .iter()
                .enumerate()
                .filter_map(|(i, todo)| {
                    let content = todo.get("content").and_then(Value::as_str)?;
                    Some(TaskDraft {
                        external_id: None,
                        content: Some(content.to_string()),
                        status: Some(parse_status(todo.get("status"))),
                        priority: todo
                            .get("priority")
                            .and_then(Value::as_str)
                            .map(String::from),
                        position: Some(i as i64),
                        source_tool_name: "TodoWrite".to_string(),
                    })
                })
                .collect();
            Some(TaskToolOp::ReplaceAll(drafts))
        }
        "taskcreate" => {
            let content = raw_input
                .get("subject")
                .or_else(|| raw_input.get("content"))
                .and_then(Value::as_str)?;
            Some(TaskToolOp::Upsert(TaskDraft {
                external_id: task_id(raw_input),
                content: Some(content.to_string()),
                status: Some(parse_status(raw_input.get("status"))),
                priority: raw_input
                    .get("priority")
                    .and_then(Value::as_str)
                    .map(String::from),
                position: raw_input.get("position").and_then(Value::as_i64),
                source_tool_name: "TaskCreate".to_string(),
            }))
        }
        "taskupdate" => {
            let external_id = task_id(raw_input)?;
            Some(TaskToolOp::Upsert(TaskDraft {
                external_id: Some(external_id),
                content: raw_input
                    .get("subject")
                    .or_else(|| raw_input.get("content"))
                    .and_then(Value::as_str)
                    .map(String::from),
                status: raw_input.get("status").map(|s| parse_status(Some(s))),
                priority: raw_input
                    .get("priority")
                    .and_then(Value::as_str)
                    .map(String::from),
                position: raw_input.get("position").and_then(Value::as_i64),
                source_tool_name: "TaskUpdate".to_string(),
            }))
        }
        _ => None,
    }
}

fn task_id(raw_input: &Value) -> Option<String> {
    raw_input
        .get("taskId")
        .or_else(|| raw_input.get("id"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn parse_status(v: Option<&Value>) -> TaskStatus {
    TaskStatus::parse(v.and_then(Value::as_str).unwrap_or("pending"))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
