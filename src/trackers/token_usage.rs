use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::types::TokenUsage;
use crate::trackers::{CompanionTracker, TrackerError, WorkflowHistory};

pub const TOKEN_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSample {
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub usage: TokenUsage,
}

/// Totals over the samples currently retained for a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub samples: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_context_window_percent: Option<f64>,
}

/// Per-workflow record of token-usage samples.
pub struct TokenLedger {
    history: WorkflowHistory<TokenSample>,
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new(TOKEN_HISTORY_CAPACITY)
    }
}

impl TokenLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: WorkflowHistory::new("token-usage", capacity),
        }
    }

    pub fn record(
        &self,
        workflow: &str,
        step: &str,
        usage: &TokenUsage,
        timestamp: DateTime<Utc>,
    ) -> Result<(), TrackerError> {
        self.history.push(
            workflow,
            TokenSample {
                timestamp,
                step: step.to_string(),
                usage: usage.clone(),
            },
        )
    }

    pub fn samples(&self, workflow: &str) -> Result<Vec<TokenSample>, TrackerError> {
        self.history.get(workflow)
    }

    pub fn summary(&self, workflow: &str) -> Result<TokenSummary, TrackerError> {
        let samples = self.history.get(workflow)?;
        let mut summary = TokenSummary {
            samples: samples.len(),
            ..TokenSummary::default()
        };
        for sample in &samples {
            summary.input_tokens += sample.usage.input_tokens;
            summary.output_tokens += sample.usage.output_tokens;
            summary.total_tokens += sample.usage.total_tokens;
            summary.total_cost += sample.usage.cost.unwrap_or(0.0);
            if let Some(pct) = sample.usage.context_window_percent {
                let peak = summary.peak_context_window_percent.get_or_insert(pct);
                *peak = peak.max(pct);
            }
        }
        Ok(summary)
    }
}

impl CompanionTracker for TokenLedger {
    fn name(&self) -> &str {
        "token-usage"
    }

    fn tracked_workflow_names(&self) -> Result<HashSet<String>, TrackerError> {
        self.history.workflows()
    }

    fn clear(&self, workflow: &str) -> Result<(), TrackerError> {
        self.history.remove(workflow)
    }

    fn trim_to(&self, max_len: usize) -> Result<usize, TrackerError> {
        self.history.trim_to(max_len)
    }
}
