// Model-facing contracts: the prompts the engine sends and the parsers that
// read structured task lists and review verdicts back out of model text.
// Parsing tries strict top-level JSON first, then fenced code blocks, then a
// balanced-bracket slice; it never panics on malformed output.

use std::collections::HashSet;

use convoy_types::{Task, TaskStatus, ToolRegistration};
use serde::Deserialize;
use serde_json::{json, Value};

pub(crate) fn decomposition_prompt(objective: &str, task_tool: &str) -> String {
    format!(
        "Break this objective into the smallest set of independently completable tasks.\n\n\
         Objective:\n{objective}\n\n\
         Respond with only a JSON array, one object per task:\n\
         [{{\"id\": \"task_1\", \"description\": \"...\", \"dependencies\": []}}]\n\n\
         Order tasks so dependencies come first. While implementing, report every \
         status change through the `{task_tool}` tool."
    )
}

pub(crate) fn fix_decomposition_prompt(fix_specification: &str, task_tool: &str) -> String {
    format!(
        "Review found problems that must be fixed.\n\n\
         Fix plan:\n{fix_specification}\n\n\
         Break the fix plan into tasks. Respond with only a JSON array, one object per task:\n\
         [{{\"id\": \"fix_1\", \"description\": \"...\", \"dependencies\": []}}]\n\n\
         Report every status change through the `{task_tool}` tool."
    )
}

pub(crate) fn continuation_prompt(
    objective: &str,
    tasks: &[Task],
    directives: &[String],
    task_tool: &str,
) -> String {
    let mut prompt = String::new();
    if tasks.is_empty() {
        prompt.push_str(&format!(
            "No task list has been recorded yet for this objective:\n{objective}\n\n\
             Respond with only a JSON array of tasks:\n\
             [{{\"id\": \"task_1\", \"description\": \"...\", \"dependencies\": []}}]"
        ));
    } else {
        prompt.push_str("Continue working the task list. Outstanding tasks:\n");
        for task in tasks.iter().filter(|t| t.status != TaskStatus::Completed) {
            let deps = if task.dependencies.is_empty() {
                String::new()
            } else {
                format!(" (waiting on: {})", task.dependencies.join(", "))
            };
            prompt.push_str(&format!(
                "- [{}] {}: {}{}\n",
                status_label(task.status),
                task.id,
                task.description,
                deps
            ));
        }
        prompt.push_str(&format!(
            "\nMark every status change with the `{task_tool}` tool: in_progress when you \
             start a task, completed when it is done, error when it cannot be finished."
        ));
    }
    for directive in directives {
        prompt.push_str("\n\n");
        prompt.push_str(directive);
    }
    prompt
}

pub(crate) fn review_prompt(objective: &str, tasks: &[Task]) -> String {
    let mut done = String::new();
    for task in tasks {
        done.push_str(&format!("- {}: {}\n", task.id, task.description));
    }
    format!(
        "Review the finished work against the objective.\n\n\
         Objective:\n{objective}\n\n\
         Tasks reported complete:\n{done}\n\
         Respond with only a JSON object:\n\
         {{\"fixes_required\": false, \"findings\": [], \"fix_specification\": null}}\n\n\
         Set fixes_required to true only when something must change, list each problem \
         in findings, and describe exactly what to change in fix_specification."
    )
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Error => "error",
        TaskStatus::Blocked => "blocked",
    }
}

pub(crate) fn task_tool_registration(name: &str) -> ToolRegistration {
    ToolRegistration::new(
        name,
        "Record the run task list or update task statuses",
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "description": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed", "error", "blocked"]
                            },
                            "dependencies": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["id", "description", "status"]
                    }
                }
            },
            "required": ["tasks"]
        }),
    )
}

pub(crate) fn delegate_tool_registration(name: &str) -> ToolRegistration {
    ToolRegistration::new(
        name,
        "Hand a bounded sub-task to a delegate agent and report its result",
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "description": { "type": "string" }
            },
            "required": ["description"]
        }),
    )
    .with_delegation()
}

/// Review verdict shape produced by the review delegate or turn.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ReviewVerdict {
    pub fixes_required: bool,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub fix_specification: Option<String>,
}

/// Extract a task list from model text. Missing ids are assigned
/// positionally, duplicate ids get numeric suffixes, and dependency
/// references to ids outside the list are dropped.
pub(crate) fn parse_task_list(text: &str) -> Option<Vec<Task>> {
    for candidate in json_candidates(text, '[', ']') {
        if let Some(tasks) = tasks_from_value(&candidate) {
            if !tasks.is_empty() {
                return Some(tasks);
            }
        }
    }
    None
}

pub(crate) fn parse_review_verdict(text: &str) -> Option<ReviewVerdict> {
    for candidate in json_candidates(text, '{', '}') {
        if let Ok(verdict) = serde_json::from_value::<ReviewVerdict>(candidate) {
            return Some(verdict);
        }
    }
    None
}

fn tasks_from_value(value: &Value) -> Option<Vec<Task>> {
    let items = value.as_array()?;
    let mut tasks: Vec<Task> = Vec::new();
    let mut assigned: HashSet<String> = HashSet::new();
    for (index, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            tracing::warn!(index, "task list entry is not an object, skipping");
            continue;
        };
        let Some(description) = obj.get("description").and_then(Value::as_str) else {
            tracing::warn!(index, "task list entry has no description, skipping");
            continue;
        };
        let raw_id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("task_{}", index + 1));
        let mut id = raw_id;
        if assigned.contains(&id) {
            let mut n = 2;
            while assigned.contains(&format!("{}_{}", id, n)) {
                n += 1;
            }
            let deduped = format!("{}_{}", id, n);
            tracing::warn!(original = %id, deduped = %deduped, "duplicate task id");
            id = deduped;
        }
        assigned.insert(id.clone());
        let dependencies = obj
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        tasks.push(Task {
            id,
            description: description.to_string(),
            status: TaskStatus::Pending,
            dependencies,
        });
    }

    let known: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for task in &mut tasks {
        task.dependencies.retain(|dep| {
            let keep = known.contains(dep);
            if !keep {
                tracing::warn!(task = %task.id, dependency = %dep, "dropping unknown dependency");
            }
            keep
        });
    }
    Some(tasks)
}

/// Candidate JSON values found in the text, strictest first.
fn json_candidates(text: &str, open: char, close: char) -> Vec<Value> {
    let mut candidates = Vec::new();
    let trimmed = text.trim();
    if trimmed.starts_with(open) {
        if let Ok(value) = serde_json::from_str(trimmed) {
            candidates.push(value);
        }
    }
    for block in fenced_blocks(text) {
        let block = block.trim();
        if block.starts_with(open) {
            if let Ok(value) = serde_json::from_str(block) {
                candidates.push(value);
            }
        }
    }
    if let Some(slice) = balanced_slice(text, open, close) {
        if let Ok(value) = serde_json::from_str(slice) {
            candidates.push(value);
        }
    }
    candidates
}

/// Bodies of ``` fences whose tag is empty or `json`.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let Some(newline) = after.find('\n') else {
            break;
        };
        let tag = after[..newline].trim();
        let body = &after[newline + 1..];
        let Some(end) = body.find("```") else {
            break;
        };
        if tag.is_empty() || tag.eq_ignore_ascii_case("json") {
            blocks.push(&body[..end]);
        }
        rest = &body[end + 3..];
    }
    blocks
}

/// Slice from the first `open` to its balanced `close`, honoring JSON string
/// literals and escapes.
fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..start + i + ch.len_utf8()]);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_array_parses_directly() {
        let text = r#"[{"id": "a", "description": "первый", "dependencies": []},
                       {"id": "b", "description": "second", "dependencies": ["a"]}]"#;
        let tasks = parse_task_list(text).expect("parse");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "a");
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn fenced_block_wins_over_surrounding_prose() {
        let text = "Here is the plan:\n```json\n[{\"id\": \"t1\", \"description\": \"do it\"}]\n```\nLet me know.";
        let tasks = parse_task_list(text).expect("parse");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t1");
    }

    #[test]
    fn bracket_scan_recovers_embedded_array() {
        let text = "Sure! The tasks are [{\"id\": \"t1\", \"description\": \"x [see notes]\"}] as requested.";
        let tasks = parse_task_list(text).expect("parse");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "x [see notes]");
    }

    #[test]
    fn missing_and_duplicate_ids_are_normalized() {
        let text = r#"[{"description": "no id"},
                       {"id": "dup", "description": "first"},
                       {"id": "dup", "description": "second"}]"#;
        let tasks = parse_task_list(text).expect("parse");
        assert_eq!(tasks[0].id, "task_1");
        assert_eq!(tasks[1].id, "dup");
        assert_eq!(tasks[2].id, "dup_2");
    }

    #[test]
    fn unknown_dependency_references_are_dropped() {
        let text = r#"[{"id": "t1", "description": "a", "dependencies": ["ghost", "t2"]},
                       {"id": "t2", "description": "b"}]"#;
        let tasks = parse_task_list(text).expect("parse");
        assert_eq!(tasks[0].dependencies, vec!["t2".to_string()]);
    }

    #[test]
    fn garbage_yields_none_without_panicking() {
        assert!(parse_task_list("no json here at all").is_none());
        assert!(parse_task_list("[{ truncated").is_none());
        assert!(parse_task_list("[]").is_none(), "empty list is no plan");
        assert!(parse_review_verdict("{ \"fixes_required\": \"yes\" }").is_none());
    }

    #[test]
    fn verdict_parses_with_defaults() {
        let verdict = parse_review_verdict("{\"fixes_required\": true}").expect("parse");
        assert!(verdict.fixes_required);
        assert!(verdict.findings.is_empty());
        assert!(verdict.fix_specification.is_none());

        let full = parse_review_verdict(
            "The verdict:\n```json\n{\"fixes_required\": true, \"findings\": [\"no tests\"], \
             \"fix_specification\": \"add tests\"}\n```",
        )
        .expect("parse");
        assert_eq!(full.findings, vec!["no tests".to_string()]);
        assert_eq!(full.fix_specification.as_deref(), Some("add tests"));
    }

    #[test]
    fn prompts_reference_the_configured_tool() {
        let prompt = decomposition_prompt("ship the codec", "update_tasks");
        assert!(prompt.contains("ship the codec"));
        assert!(prompt.contains("`update_tasks`"));

        let tasks = vec![
            Task::new("t1", "done already").with_status(TaskStatus::Completed),
            Task::new("t2", "still open").with_dependencies(vec!["t1".to_string()]),
        ];
        let cont = continuation_prompt("obj", &tasks, &["Delegate t2 now.".to_string()], "update_tasks");
        assert!(!cont.contains("done already"), "completed tasks are omitted");
        assert!(cont.contains("still open"));
        assert!(cont.contains("waiting on: t1"));
        assert!(cont.ends_with("Delegate t2 now."));

        let empty = continuation_prompt("obj", &[], &[], "update_tasks");
        assert!(empty.contains("No task list has been recorded yet"));
    }

    #[test]
    fn tool_registrations_carry_the_delegation_flag() {
        assert!(!task_tool_registration("update_tasks").delegation);
        assert!(delegate_tool_registration("delegate").delegation);
    }
}
