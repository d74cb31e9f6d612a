// =============================================================================
// Subprocess Predictor — invokes an external scoring process with a deadline
// =============================================================================
//
// The model itself is out of scope (§1); this crate only needs a bounded way
// to call into it. The external process is expected to read one JSON feature
// vector from stdin and write one JSON probability to stdout, then exit.
// On deadline, spawn failure, or malformed output `predict` returns `Err` so
// a wrapping predictor (`CachingPredictor`) can route to its fallback
// instead of caching a failed attempt as a genuine zero score.
// =============================================================================

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, AsyncReadExt};
use tokio::process::Command;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::model::FeatureVector;

use super::Predictor;

/// Invokes `command` once per `predict` call with a hard deadline.
pub struct SubprocessPredictor {
    command: String,
    args: Vec<String>,
    deadline: Duration,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

impl SubprocessPredictor {
    pub fn new(command: impl Into<String>, args: Vec<String>, deadline: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            deadline,
            timeouts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn run(&self, features: FeatureVector) -> anyhow::Result<f64> {
        let payload = serde_json::to_vec(&features)?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout).await?;
        }
        child.wait().await?;

        let value: serde_json::Value = serde_json::from_str(stdout.trim())?;
        let prob = value
            .get("probability")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("missing probability field"))?;

        if !prob.is_finite() {
            anyhow::bail!("non-finite probability returned: {prob}");
        }
        Ok(prob.clamp(0.0, 1.0))
    }
}

#[async_trait]
impl Predictor for SubprocessPredictor {
    async fn predict(&self, features: FeatureVector) -> EngineResult<f64> {
        match tokio::time::timeout(self.deadline, self.run(features)).await {
            Ok(Ok(prob)) => Ok(prob),
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "predictor subprocess failed");
                Err(EngineError::PredictorUnavailable(e.to_string()))
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(deadline = ?self.deadline, "predictor subprocess timed out");
                Err(EngineError::PredictorUnavailable("deadline exceeded".into()))
            }
        }
    }

    async fn health(&self) -> bool {
        tokio::time::timeout(self.deadline, Command::new(&self.command).arg("--health").output())
            .await
            .ok()
            .and_then(|r| r.ok())
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}
