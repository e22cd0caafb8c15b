use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRequest, AgentRunner};
use crate::gates::{GateDecision, GateInput};
use crate::state::retry::truncate_tail;

const MAX_REVIEW_OUTPUT_CHARS: usize = 12_000;

/// Reviews phase output and decides whether it may proceed.
#[async_trait]
pub trait AiReviewer: Send + Sync {
    async fn review(
        &self,
        input: &GateInput<'_>,
        cancel: CancellationToken,
    ) -> Result<GateDecision>;
}

/// AI reviewer that asks the agent runner for a JSON verdict.
pub struct AgentReviewer {
    agent: Arc<dyn AgentRunner>,
}

impl AgentReviewer {
    pub fn new(agent: Arc<dyn AgentRunner>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl AiReviewer for AgentReviewer {
    async fn review(
        &self,
        input: &GateInput<'_>,
        cancel: CancellationToken,
    ) -> Result<GateDecision> {
        let request = AgentRequest {
            task_id: input.task.id.clone(),
            phase_id: format!("{}-gate", input.phase_id),
            attempt: 1,
            prompt: build_review_prompt(input),
            working_dir: input.working_dir.to_path_buf(),
            resume_session: None,
            timeout: None,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = self.agent.invoke(request, tx, cancel).await?;
        if !outcome.succeeded() {
            return Err(anyhow!("AI review failed: {}", outcome.failure_summary()));
        }
        parse_review_response(&outcome.output)
            .ok_or_else(|| anyhow!("AI review returned no recognizable decision"))
    }
}

pub fn build_review_prompt(input: &GateInput<'_>) -> String {
    format!(
        r#"You are reviewing the output of the `{phase}` phase for task {id}: {title}.

## TASK DESCRIPTION
{description}

## PHASE OUTPUT
{output}

## INSTRUCTIONS
Inspect the working tree and the output above. Decide whether the phase met its goal.
Respond with a single JSON object and nothing else:

```json
{{"decision": "APPROVED" | "REJECTED" | "NEEDS_CLARIFICATION", "reason": "...", "questions": []}}
```
"#,
        phase = input.phase_id,
        id = input.task.id,
        title = input.task.title,
        description = if input.task.description.is_empty() {
            "(none)"
        } else {
            input.task.description.as_str()
        },
        output = truncate_tail(input.output, MAX_REVIEW_OUTPUT_CHARS),
    )
}

/// Parse a reviewer verdict from text that may wrap the JSON in prose.
pub fn parse_review_response(response: &str) -> Option<GateDecision> {
    let json = extract_json(response)?;
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;

    let decision = value.get("decision")?.as_str()?.to_uppercase();
    let reason = value
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("No reason provided")
        .to_string();
    let questions: Vec<String> = value
        .get("questions")
        .and_then(|v| v.as_array())
        .map(|qs| {
            qs.iter()
                .filter_map(|q| q.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    match decision.as_str() {
        "APPROVED" => Some(GateDecision::approve(reason)),
        "REJECTED" => Some(GateDecision::reject(reason)),
        "NEEDS_CLARIFICATION" => {
            let mut reason = format!("needs clarification: {}", reason);
            for q in &questions {
                reason.push_str("\n- ");
                reason.push_str(q);
            }
            Some(GateDecision::reject(reason).with_questions(questions))
        }
        _ => None,
    }
}

/// Pull a JSON object out of a fenced block or surrounding prose.
fn extract_json(response: &str) -> Option<String> {
    if let Some(start) = response.find("```json") {
        let after = &response[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_string());
        }
    }

    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in response[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(response[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
