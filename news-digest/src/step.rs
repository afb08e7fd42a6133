//! Durable step execution.
//!
//! A step is a named unit of work inside a workflow run. Its result is stored
//! under `(run_id, step_name)`; once a step succeeded, calling it again under
//! the same key returns the stored value instead of running the closure. That
//! is what makes re-entering a run after a crash safe: emails already sent and
//! AI calls already paid for are not repeated.

use crate::types::{DigestError, Result, RetryPolicy, RunStatus, StepResult, StepStatus, Summarizer, WorkflowRun};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Storage for step results and run records.
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn load_step(&self, run_id: Uuid, step_name: &str) -> Result<Option<StepResult>>;

    /// Must never replace a `succeeded` entry.
    async fn save_step(&self, result: &StepResult) -> Result<()>;

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>>;

    async fn save_run(&self, run: &WorkflowRun) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryStepStore {
    steps: RwLock<HashMap<(Uuid, String), StepResult>>,
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
}

impl InMemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn step_results(&self, run_id: Uuid) -> Vec<StepResult> {
        let steps = self.steps.read().await;
        let mut results: Vec<StepResult> = steps
            .values()
            .filter(|result| result.run_id == run_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.step_name.cmp(&b.step_name));
        results
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn load_step(&self, run_id: Uuid, step_name: &str) -> Result<Option<StepResult>> {
        let steps = self.steps.read().await;
        Ok(steps.get(&(run_id, step_name.to_string())).cloned())
    }

    async fn save_step(&self, result: &StepResult) -> Result<()> {
        let mut steps = self.steps.write().await;
        let key = (result.run_id, result.step_name.clone());
        if let Some(existing) = steps.get(&key) {
            if existing.status == StepStatus::Succeeded {
                return Ok(());
            }
        }
        steps.insert(key, result.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }
}

type StepKey = (Uuid, String);

pub struct StepExecutor {
    store: Arc<dyn StepStore>,
    summarizer: Arc<dyn Summarizer>,
    retry: RetryPolicy,
    // One lock per step key: check-then-write never races two executions.
    key_locks: Mutex<HashMap<StepKey, Arc<Mutex<()>>>>,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn StepStore>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            store,
            summarizer,
            retry: RetryPolicy::default(),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> Arc<dyn StepStore> {
        self.store.clone()
    }

    /// Run `step` once per `(run_id, step_name)`, retrying per the executor's policy.
    pub async fn run<T, F, Fut>(&self, run_id: Uuid, step_name: &str, step: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = self.retry.clone();
        self.run_with_policy(run_id, step_name, &policy, step).await
    }

    pub async fn run_with_policy<T, F, Fut>(&self, run_id: Uuid, step_name: &str, policy: &RetryPolicy, mut step: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key_lock = self.key_lock(run_id, step_name).await;
        let _guard = key_lock.lock().await;

        let previous = self.store.load_step(run_id, step_name).await?;
        if let Some(previous) = &previous {
            if previous.status == StepStatus::Succeeded {
                debug!(%run_id, step = step_name, "Step already succeeded, returning memoized value");
                let value = previous.value.clone().unwrap_or(serde_json::Value::Null);
                return Ok(serde_json::from_value(value)?);
            }
        }
        let prior_attempts = previous.map(|result| result.attempts).unwrap_or(0);

        let max_attempts = policy.max_attempts.max(1);
        let mut backoff = exponential_backoff(policy);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match step().await {
                Ok(value) => {
                    let payload = serde_json::to_value(&value)?;
                    self.store
                        .save_step(&StepResult::succeeded(run_id, step_name, prior_attempts + attempt, payload))
                        .await?;
                    debug!(%run_id, step = step_name, attempt, "Step succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    if attempt < max_attempts {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!(%run_id, step = step_name, "Attempt {} failed, retrying in {:?}: {:#}", attempt, delay, e);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }

                    let message = format!("{:#}", e);
                    let attempts = prior_attempts + attempt;
                    self.store
                        .save_step(&StepResult::failed(run_id, step_name, attempts, message.clone()))
                        .await?;
                    error!(%run_id, step = step_name, "Step failed after {} attempt(s): {}", attempts, message);
                    return Err(DigestError::StepFailed {
                        step: step_name.to_string(),
                        attempts,
                        message,
                    });
                }
            }
        }
    }

    /// One memoized call to the summarizer. Failure, a response without text
    /// or blank text all come back as `None`.
    pub async fn infer_ai(&self, run_id: Uuid, step_name: &str, prompt: &str) -> Option<String> {
        let summarizer = self.summarizer.clone();
        let prompt = prompt.to_string();

        let outcome: Result<Option<String>> = self
            .run_with_policy(run_id, step_name, &RetryPolicy::single_attempt(), move || {
                let summarizer = summarizer.clone();
                let prompt = prompt.clone();
                async move { summarizer.infer(&prompt).await }
            })
            .await;

        match outcome {
            Ok(Some(text)) if !text.trim().is_empty() => Some(text),
            Ok(_) => {
                warn!(%run_id, step = step_name, "Inference returned no text");
                None
            }
            Err(e) => {
                warn!(%run_id, step = step_name, "Inference unavailable: {}", e);
                None
            }
        }
    }

    /// Load the run with this id or create it, then move it to `running`.
    /// A completed run is returned unchanged; its steps replay from the store.
    pub async fn begin_run(&self, run_id: Uuid, workflow: &str) -> Result<WorkflowRun> {
        let mut run = match self.store.load_run(run_id).await? {
            Some(run) => {
                info!(%run_id, status = %run.status, "Resuming existing run");
                run
            }
            None => {
                let run = WorkflowRun::new(run_id, workflow);
                self.store.save_run(&run).await?;
                run
            }
        };

        if matches!(run.status, RunStatus::Pending | RunStatus::Failed) {
            run.transition(RunStatus::Running)?;
            self.store.save_run(&run).await?;
        }
        Ok(run)
    }

    pub async fn finish_run(&self, run: &mut WorkflowRun, error: Option<String>) -> Result<()> {
        if run.status == RunStatus::Running {
            match error {
                Some(error) => run.fail(error)?,
                None => run.transition(RunStatus::Completed)?,
            }
            self.store.save_run(run).await?;
        }
        self.forget_run(run.run_id).await;
        Ok(())
    }

    /// Drop the in-process locks held for a finished run.
    pub async fn forget_run(&self, run_id: Uuid) {
        self.key_locks.lock().await.retain(|(id, _), _| *id != run_id);
    }

    async fn key_lock(&self, run_id: Uuid, step_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry((run_id, step_name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn exponential_backoff(policy: &RetryPolicy) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: policy.initial_interval,
        initial_interval: policy.initial_interval,
        randomization_factor: 0.0,
        multiplier: policy.multiplier,
        max_interval: policy.max_interval,
        max_elapsed_time: None,
        ..Default::default()
    }
}
