//! The Review Agent: a distinct LLM role evaluating a completed sub-agent
//! task's result against its `review_criteria`. Built the way teacher's
//! `title_generator.rs` builds an auxiliary LLM call: a fixed instruction
//! template, a bounded timeout, and a deterministic fallback on timeout or
//! error — here the fallback is `Accept`, since failing every pending task
//! during an LLM outage would be worse than the rare false accept.

use crate::llm::LlmBackend;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const REVIEW_TIMEOUT: Duration = Duration::from_secs(20);

const REVIEW_PROMPT_TEMPLATE: &str = r#"You are reviewing the output of an automated task against its acceptance criteria.

Criteria: {criteria}
Today's date: {today}

Result to review:
{result}

Respond with JSON: either {"verdict": "accept"} or
{"verdict": "reject", "feedback": "...", "suggestions": ["..."], "missing_dimensions": ["..."]}."#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ReviewVerdict {
    Accept,
    Reject {
        feedback: String,
        #[serde(default)]
        suggestions: Vec<String>,
        #[serde(default)]
        missing_dimensions: Vec<String>,
    },
}

pub struct ReviewAgent {
    llm: Arc<dyn LlmBackend>,
}

impl ReviewAgent {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self { llm }
    }

    /// Evaluate `result` against `criteria`. Falls back to `Accept` if the
    /// backend errors or the call exceeds `REVIEW_TIMEOUT`, logged as a
    /// degraded pass rather than surfaced as a task failure.
    pub async fn review(&self, result: &str, criteria: &str, today: NaiveDate) -> ReviewVerdict {
        let prompt = REVIEW_PROMPT_TEMPLATE
            .replace("{criteria}", criteria)
            .replace("{today}", &today.to_string())
            .replace("{result}", result);

        let outcome = tokio::time::timeout(REVIEW_TIMEOUT, self.llm.summarize(&prompt)).await;

        match outcome {
            Ok(Ok(raw)) => parse_verdict(&raw).unwrap_or_else(|| {
                tracing::warn!("review agent returned unparsable verdict, defaulting to accept");
                ReviewVerdict::Accept
            }),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "review agent call failed, defaulting to accept");
                ReviewVerdict::Accept
            }
            Err(_) => {
                tracing::warn!("review agent timed out, defaulting to accept");
                ReviewVerdict::Accept
            }
        }
    }
}

fn parse_verdict(raw: &str) -> Option<ReviewVerdict> {
    let trimmed = raw.trim();
    let json_start = trimmed.find('{')?;
    let json_end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[json_start..=json_end]).ok()
}
