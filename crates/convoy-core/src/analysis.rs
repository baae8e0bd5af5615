//! Canary analysis evaluation.

use async_trait::async_trait;

use crate::Result;
use crate::deployment::Deployment;

/// Scores a canary step against the configured metrics. The metrics backend
/// is an external collaborator; the engine only compares the aggregate score
/// to the manifest's threshold. Without an evaluator wired in, analysis
/// passes trivially.
#[async_trait]
pub trait AnalysisEvaluator: Send + Sync {
    /// Returns an aggregate score; the step passes when score >= threshold.
    async fn evaluate(&self, deployment: &Deployment, metrics: &[String]) -> Result<f64>;
}
