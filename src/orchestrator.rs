//! Task orchestrator - drives per-target analyses through the agent
//!
//! Each target moves through `Pending -> FirstAttempt -> (Accepted |
//! Retrying) -> Done`. Failures of any kind end as a result record carrying
//! the error text; nothing a single target does can abort a batch.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::config::{AgentConfig, OrchestratorConfig};
use crate::error::ProbeError;
use crate::extract::extract_or_parse;
use crate::invoker::{AgentBackend, RunOutcome};
use crate::retry::{is_weak, merge, TargetResult};
use crate::target::{SecurityIssue, Target};

/// A kind of analysis: how to prompt for it and how to read the answer
pub trait AnalysisTask: Send + Sync + 'static {
    type Output: TargetResult + fmt::Debug;

    /// Short label for logs
    fn kind(&self) -> &'static str;

    fn normalize(&self, raw: &str) -> Result<Target, ProbeError>;

    /// First-pass prompt
    fn prompt(&self, target: &Target) -> String;

    /// Narrower prompt used after a weak first attempt
    fn retry_prompt(&self, target: &Target, first: &Self::Output) -> String;

    /// Map a structured answer onto a result; never fails
    fn parse(&self, target: &Target, answer: &Map<String, Value>) -> Self::Output;

    /// Result record for a target that produced no answer.
    /// `target` is `None` when `raw` could not be normalized.
    fn failure(&self, raw: &str, target: Option<&Target>, message: String) -> Self::Output;
}

/// Where a target is in its analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pending,
    FirstAttempt,
    Accepted,
    Retrying,
    Done,
}

struct Progress<'a> {
    target: &'a str,
    stage: Stage,
}

impl<'a> Progress<'a> {
    fn new(target: &'a str) -> Self {
        Self {
            target,
            stage: Stage::Pending,
        }
    }

    fn advance(&mut self, next: Stage) {
        debug!(url = self.target, from = ?self.stage, to = ?next, "Target stage");
        self.stage = next;
    }
}

/// Outcome of a single invocation
struct Attempt<R> {
    result: R,
    /// The gateway link failed; a retry would fail the same way
    link_lost: bool,
}

/// Runs one [`AnalysisTask`] over targets
pub struct TaskOrchestrator<T: AnalysisTask> {
    task: Arc<T>,
    backend: Arc<dyn AgentBackend>,
    agent: AgentConfig,
    config: OrchestratorConfig,
}

impl<T: AnalysisTask> Clone for TaskOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
            backend: Arc::clone(&self.backend),
            agent: self.agent.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: AnalysisTask> TaskOrchestrator<T> {
    pub fn new(
        task: T,
        backend: Arc<dyn AgentBackend>,
        agent: AgentConfig,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            task: Arc::new(task),
            backend,
            agent,
            config,
        }
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    /// Analyze one target, retrying once if the first attempt is weak
    #[instrument(skip(self), fields(kind = self.task.kind()))]
    pub async fn analyze_one(&self, raw: &str) -> T::Output {
        let started = Instant::now();
        let mut progress = Progress::new(raw);

        let target = match self.task.normalize(raw) {
            Ok(target) => target,
            Err(e) => {
                warn!(url = raw, error = %e, "Skipping invalid target");
                progress.advance(Stage::Done);
                return self.task.failure(raw, None, e.to_string());
            }
        };

        progress.advance(Stage::FirstAttempt);
        let session_key = self.backend.session_key();
        let prompt = self.task.prompt(&target);
        let first = self
            .attempt(&target, &prompt, &session_key, self.agent.completion_timeout())
            .await;

        let mut result = if first.link_lost {
            warn!(url = %target, session = %session_key, "Gateway unavailable, not retrying");
            first.result
        } else if is_weak(&first.result) {
            let first = first.result;
            progress.advance(Stage::Retrying);
            info!(
                url = %target,
                session = %session_key,
                issues = ?first.security_issues(),
                error = first.error_message().unwrap_or_default(),
                "Weak first attempt, retrying"
            );
            let prompt = self.task.retry_prompt(&target, &first);
            let mut retry = self
                .attempt(&target, &prompt, &session_key, self.agent.retry_timeout())
                .await
                .result;
            if let Some(error) = retry.error_message().map(|e| format!("retry failed: {e}")) {
                retry.set_error_message(Some(error));
            }
            merge(first, retry)
        } else {
            progress.advance(Stage::Accepted);
            first.result
        };
        result.set_elapsed(started.elapsed());
        progress.advance(Stage::Done);

        info!(
            url = %target,
            entries = result.entry_count(),
            issues = ?result.security_issues(),
            error = result.error_message().unwrap_or_default(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Target analysed"
        );
        result
    }

    /// One agent invocation turned into a result
    async fn attempt(
        &self,
        target: &Target,
        prompt: &str,
        session_key: &str,
        timeout: Duration,
    ) -> Attempt<T::Output> {
        let raw = target.url.as_str();
        let reply = match self.backend.invoke(prompt, Some(session_key), timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                let mut failed = self.task.failure(raw, Some(target), e.to_string());
                if e.is_timeout() {
                    failed.set_security_issues(vec![SecurityIssue::Timeout]);
                }
                return Attempt {
                    result: failed,
                    link_lost: e.is_connection(),
                };
            }
        };

        let result = match reply.outcome {
            RunOutcome::Completed { text, source } => {
                debug!(url = %target, ?source, "Agent answered");
                self.read_answer(target, &text)
            }
            RunOutcome::TimedOut { partial } => {
                let message = format!(
                    "agent run {} timed out after {}s",
                    reply.run_id,
                    timeout.as_secs()
                );
                let salvaged = partial.and_then(|text| {
                    self.read_answer_checked(target, &text)
                        .map_err(|e| debug!(url = %target, error = %e, "Partial answer unusable"))
                        .ok()
                });
                match salvaged {
                    Some(result) => result,
                    None => {
                        let mut failed = self.task.failure(raw, Some(target), message);
                        failed.set_security_issues(vec![SecurityIssue::Timeout]);
                        failed
                    }
                }
            }
            RunOutcome::Failed(failure) => self.task.failure(raw, Some(target), failure.to_string()),
        };
        Attempt {
            result,
            link_lost: false,
        }
    }

    fn read_answer_checked(&self, target: &Target, text: &str) -> Result<T::Output, ProbeError> {
        extract_or_parse(text)
            .map(|answer| self.task.parse(target, &answer))
            .map_err(ProbeError::Parse)
    }

    fn read_answer(&self, target: &Target, text: &str) -> T::Output {
        self.read_answer_checked(target, text).unwrap_or_else(|e| {
            self.task
                .failure(target.url.as_str(), Some(target), e.to_string())
        })
    }

    /// Analyze every target with at most `concurrency` in flight.
    ///
    /// A freed slot admits the next queued target immediately. Results come
    /// back in input order.
    pub async fn analyze_many(&self, targets: &[String], concurrency: usize) -> Vec<T::Output> {
        let gate = Arc::new(Semaphore::new(concurrency.max(1)));
        let pacing = self.config.pacing();
        info!(
            kind = self.task.kind(),
            targets = targets.len(),
            concurrency = concurrency.max(1),
            "Starting batch"
        );

        let handles: Vec<_> = targets
            .iter()
            .map(|raw| {
                let this = self.clone();
                let gate = Arc::clone(&gate);
                let raw = raw.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = gate.acquire_owned().await else {
                        return this.task.failure(&raw, None, "admission gate closed".into());
                    };
                    if let Some(delay) = pacing {
                        tokio::time::sleep(delay).await;
                    }
                    this.analyze_one(&raw).await
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (raw, handle) in targets.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(url = %raw, error = %e, "Analysis task failed");
                    self.task.failure(raw, None, format!("analysis task failed: {e}"))
                }
            };
            results.push(result);
        }

        let valid = results.iter().filter(|r| r.is_valid()).count();
        info!(kind = self.task.kind(), total = results.len(), valid, "Batch finished");
        results
    }

    /// `analyze_many` with the configured concurrency
    pub async fn analyze_all(&self, targets: &[String]) -> Vec<T::Output> {
        self.analyze_many(targets, self.config.concurrency).await
    }
}
