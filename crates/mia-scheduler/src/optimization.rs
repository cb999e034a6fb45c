//! Self-optimization cycle: the built-in periodic task that feeds user
//! feedback and recent interactions back into the assistant's learning
//! collaborators.
//!
//! The scheduler gives it no special treatment: it is a [`TaskAction`] like
//! any other, and a failing collaborator surfaces as a failed periodic run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::action::{TaskAction, TaskContext};

/// Name under which the cycle is registered.
pub const SELF_OPTIMIZATION_TASK: &str = "self_optimization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// One piece of user feedback as reported by the feedback collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feedback {
    /// Short label of the problem the user ran into, if any.
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

/// A past interaction; its shape belongs to the learning collaborator.
pub type Interaction = serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentimentTrends {
    pub positive: u32,
    pub neutral: u32,
    pub negative: u32,
}

/// Aggregated view of the feedback, passed to `update_response_patterns`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackInsights {
    /// Occurrences per reported issue.
    pub common_issues: BTreeMap<String, u32>,
    pub sentiment: SentimentTrends,
    /// Issues reported more often than the threshold, most frequent first.
    pub significant_issues: Vec<String>,
}

impl FeedbackInsights {
    pub fn from_feedback(feedback: &[Feedback], issue_threshold: u32) -> Self {
        let mut insights = FeedbackInsights::default();
        for entry in feedback {
            if let Some(issue) = entry.issue.as_deref().filter(|i| !i.is_empty()) {
                *insights.common_issues.entry(issue.to_string()).or_default() += 1;
            }
            match entry.sentiment {
                Some(Sentiment::Positive) => insights.sentiment.positive += 1,
                Some(Sentiment::Neutral) => insights.sentiment.neutral += 1,
                Some(Sentiment::Negative) => insights.sentiment.negative += 1,
                None => {}
            }
        }

        let mut significant: Vec<(&String, &u32)> = insights
            .common_issues
            .iter()
            .filter(|(_, count)| **count > issue_threshold)
            .collect();
        // Most frequent first; BTreeMap order breaks ties alphabetically.
        significant.sort_by(|a, b| b.1.cmp(a.1));
        insights.significant_issues = significant.into_iter().map(|(i, _)| i.clone()).collect();
        insights
    }
}

#[async_trait]
pub trait FeedbackSource: Send + Sync {
    async fn all_feedback(&self) -> anyhow::Result<Vec<Feedback>>;
}

#[async_trait]
pub trait InteractionSource: Send + Sync {
    async fn recent_interactions(&self) -> anyhow::Result<Vec<Interaction>>;
}

/// The learning side: retraining and response-pattern adjustment.
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn train_from_interactions(&self, interactions: &[Interaction]) -> anyhow::Result<()>;

    async fn update_response_patterns(&self, insights: &FeedbackInsights) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct OptimizationSettings {
    pub interval: Duration,
    /// Training is skipped while fewer interactions are available.
    pub min_interactions: usize,
    /// An issue must be reported more often than this to count as significant.
    pub issue_threshold: u32,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self::from(&mia_core::config::SelfOptimizationConfig::default())
    }
}

impl From<&mia_core::config::SelfOptimizationConfig> for OptimizationSettings {
    fn from(config: &mia_core::config::SelfOptimizationConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            min_interactions: config.min_interactions,
            issue_threshold: config.issue_threshold,
        }
    }
}

/// Periodic action: pull feedback and interactions, train, adjust responses.
pub struct SelfOptimizationCycle {
    feedback: Arc<dyn FeedbackSource>,
    interactions: Arc<dyn InteractionSource>,
    optimizer: Arc<dyn Optimizer>,
    settings: OptimizationSettings,
}

impl SelfOptimizationCycle {
    pub fn new(
        feedback: Arc<dyn FeedbackSource>,
        interactions: Arc<dyn InteractionSource>,
        optimizer: Arc<dyn Optimizer>,
        settings: OptimizationSettings,
    ) -> Self {
        Self {
            feedback,
            interactions,
            optimizer,
            settings,
        }
    }

    pub fn settings(&self) -> &OptimizationSettings {
        &self.settings
    }
}

#[async_trait]
impl TaskAction for SelfOptimizationCycle {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        let feedback = self
            .feedback
            .all_feedback()
            .await
            .context("fetching feedback")?;
        let interactions = self
            .interactions
            .recent_interactions()
            .await
            .context("fetching recent interactions")?;

        if interactions.len() >= self.settings.min_interactions {
            self.optimizer
                .train_from_interactions(&interactions)
                .await
                .context("training from interactions")?;
        } else {
            debug!(
                task = %ctx.name,
                available = interactions.len(),
                required = self.settings.min_interactions,
                "not enough interactions, training skipped"
            );
        }

        let insights = FeedbackInsights::from_feedback(&feedback, self.settings.issue_threshold);
        self.optimizer
            .update_response_patterns(&insights)
            .await
            .context("updating response patterns")?;

        info!(
            task = %ctx.name,
            feedback = feedback.len(),
            interactions = interactions.len(),
            significant_issues = insights.significant_issues.len(),
            "self-optimization cycle completed"
        );
        Ok(())
    }
}
