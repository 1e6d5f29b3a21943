//! Deterministic ordered startup/shutdown of registered subsystem steps
//! (§4.4). Priority orders startup ascending; shutdown runs the same list
//! in reverse. Grounded on the teacher's `AerolithsDB::new`/shutdown
//! sequential-subsystem-init pattern, generalized into a registry of named
//! steps instead of one fixed hand-written sequence.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use mantisdb_core::error::{MantisError, MantisResult};

pub type StepFn = Arc<dyn Fn() -> BoxFuture<'static, MantisResult<()>> + Send + Sync>;

/// One unit of orchestrated startup/shutdown (§4.4 "registered step").
pub struct LifecycleStep {
    pub name: String,
    pub priority: i32,
    start: StepFn,
    stop: StepFn,
}

impl LifecycleStep {
    pub fn new(name: impl Into<String>, priority: i32, start: StepFn, stop: StepFn) -> Self {
        LifecycleStep { name: name.into(), priority, start, stop }
    }
}

impl std::fmt::Debug for LifecycleStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleStep").field("name", &self.name).field("priority", &self.priority).finish()
    }
}

/// Error returned by `Coordinator::start` — the failing step plus whatever
/// unwind errors occurred while rolling back steps already started.
#[derive(Debug)]
pub struct StartupError {
    pub failed_step: String,
    pub cause: MantisError,
    pub unwind_errors: Vec<(String, MantisError)>,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "startup failed at step '{}': {}", self.failed_step, self.cause)?;
        for (name, err) in &self.unwind_errors {
            write!(f, "; unwind of '{name}' also failed: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StartupError {}

pub struct Coordinator {
    steps: Vec<LifecycleStep>,
    step_timeout: Duration,
    shutdown_budget: Duration,
}

impl Default for Coordinator {
    fn default() -> Self {
        Coordinator::new()
    }
}

impl Coordinator {
    /// Defaults match §5: 5 s per-step timeout, 30 s total shutdown budget.
    pub fn new() -> Self {
        Coordinator {
            steps: Vec::new(),
            step_timeout: Duration::from_secs(5),
            shutdown_budget: Duration::from_secs(30),
        }
    }

    pub fn with_timeouts(step_timeout: Duration, shutdown_budget: Duration) -> Self {
        Coordinator { steps: Vec::new(), step_timeout, shutdown_budget }
    }

    /// Registers a step and keeps the list sorted ascending by priority —
    /// ties preserve registration order (stable sort).
    pub fn register(&mut self, step: LifecycleStep) {
        self.steps.push(step);
        self.steps.sort_by_key(|s| s.priority);
    }

    /// Executes steps in ascending priority order. On first failure, aborts
    /// and unwinds the already-started prefix in reverse before returning
    /// (§4.4 "abort and invoke shutdown for the prefix already started").
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), StartupError> {
        let mut started: Vec<&LifecycleStep> = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let begin = Instant::now();
            let outcome = tokio::time::timeout(self.step_timeout, (step.start)()).await;
            match outcome {
                Ok(Ok(())) => {
                    info!(step = %step.name, elapsed_ms = begin.elapsed().as_millis() as u64, "lifecycle step started");
                    started.push(step);
                }
                Ok(Err(cause)) => {
                    error!(step = %step.name, error = %cause, "lifecycle step failed, unwinding");
                    let unwind_errors = self.unwind(&started).await;
                    return Err(StartupError { failed_step: step.name.clone(), cause, unwind_errors });
                }
                Err(_) => {
                    error!(step = %step.name, timeout_secs = self.step_timeout.as_secs(), "lifecycle step start timed out, unwinding");
                    let unwind_errors = self.unwind(&started).await;
                    return Err(StartupError { failed_step: step.name.clone(), cause: MantisError::Timeout, unwind_errors });
                }
            }
        }
        Ok(())
    }

    async fn unwind(&self, started: &[&LifecycleStep]) -> Vec<(String, MantisError)> {
        let mut errors = Vec::new();
        for step in started.iter().rev() {
            match tokio::time::timeout(self.step_timeout, (step.stop)()).await {
                Ok(Ok(())) => info!(step = %step.name, "lifecycle step unwound"),
                Ok(Err(e)) => {
                    warn!(step = %step.name, error = %e, "lifecycle step unwind failed");
                    errors.push((step.name.clone(), e));
                }
                Err(_) => {
                    warn!(step = %step.name, "lifecycle step unwind timed out");
                    errors.push((step.name.clone(), MantisError::Timeout));
                }
            }
        }
        errors
    }

    /// Executes steps in descending priority order (reverse of startup).
    /// Every registered step gets a shot regardless of earlier failures
    /// (§4.4); the whole sequence is additionally bounded by
    /// `shutdown_budget` — once the deadline passes, remaining steps are
    /// recorded as timed out rather than attempted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Vec<(String, MantisError)> {
        let deadline = Instant::now() + self.shutdown_budget;
        let mut errors = Vec::new();

        for step in self.steps.iter().rev() {
            if Instant::now() >= deadline {
                warn!(step = %step.name, "shutdown budget exhausted, step skipped");
                errors.push((step.name.clone(), MantisError::Timeout));
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now()).min(self.step_timeout);
            let begin = Instant::now();
            match tokio::time::timeout(remaining, (step.stop)()).await {
                Ok(Ok(())) => info!(step = %step.name, elapsed_ms = begin.elapsed().as_millis() as u64, "lifecycle step stopped"),
                Ok(Err(e)) => {
                    warn!(step = %step.name, error = %e, "lifecycle step stop reported an error, continuing");
                    errors.push((step.name.clone(), e));
                }
                Err(_) => {
                    warn!(step = %step.name, "lifecycle step stop timed out, continuing");
                    errors.push((step.name.clone(), MantisError::Timeout));
                }
            }
        }
        errors
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Waits for a shutdown signal (Ctrl+C, or SIGTERM on unix), runs
/// `coordinator.shutdown()`, and escalates to `std::process::exit(1)` if a
/// second signal arrives before shutdown completes (§4.4 "repeated signals
/// escalate... second signal triggers a hard abort after a best-effort
/// flush").
pub async fn run_until_signal(coordinator: Arc<Coordinator>) -> Vec<(String, MantisError)> {
    wait_for_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    let shutdown = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.shutdown().await }
    });

    tokio::select! {
        result = shutdown => result.unwrap_or_else(|_| vec![("join".to_string(), MantisError::Internal("shutdown task panicked".to_string()))]),
        _ = wait_for_signal() => {
            error!("second shutdown signal received, aborting immediately after best-effort flush");
            std::process::exit(1);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_step(name: &str, priority: i32, order: Arc<parking_lot::Mutex<Vec<String>>>) -> LifecycleStep {
        let start_order = Arc::clone(&order);
        let start_name = name.to_string();
        let stop_order = order;
        let stop_name = name.to_string();
        LifecycleStep::new(
            name,
            priority,
            Arc::new(move || {
                let order = Arc::clone(&start_order);
                let name = start_name.clone();
                Box::pin(async move {
                    order.lock().push(format!("start:{name}"));
                    Ok(())
                })
            }),
            Arc::new(move || {
                let order = Arc::clone(&stop_order);
                let name = stop_name.clone();
                Box::pin(async move {
                    order.lock().push(format!("stop:{name}"));
                    Ok(())
                })
            }),
        )
    }

    fn failing_step(name: &str, priority: i32) -> LifecycleStep {
        LifecycleStep::new(
            name,
            priority,
            Arc::new(|| Box::pin(async { Err(MantisError::Internal("boom".to_string())) })),
            Arc::new(|| Box::pin(async { Ok(()) })),
        )
    }

    #[tokio::test]
    async fn start_runs_steps_in_priority_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new();
        coordinator.register(ok_step("b", 2, Arc::clone(&order)));
        coordinator.register(ok_step("a", 1, Arc::clone(&order)));
        coordinator.start().await.unwrap();
        assert_eq!(*order.lock(), vec!["start:a", "start:b"]);
    }

    #[tokio::test]
    async fn shutdown_runs_steps_in_reverse_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new();
        coordinator.register(ok_step("a", 1, Arc::clone(&order)));
        coordinator.register(ok_step("b", 2, Arc::clone(&order)));
        coordinator.start().await.unwrap();
        order.lock().clear();
        let errors = coordinator.shutdown().await;
        assert!(errors.is_empty());
        assert_eq!(*order.lock(), vec!["stop:b", "stop:a"]);
    }

    #[tokio::test]
    async fn failed_start_unwinds_prefix_in_reverse() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new();
        coordinator.register(ok_step("a", 1, Arc::clone(&order)));
        coordinator.register(ok_step("b", 2, Arc::clone(&order)));
        coordinator.register(failing_step("c", 3));

        let result = coordinator.start().await;
        let err = result.unwrap_err();
        assert_eq!(err.failed_step, "c");
        assert_eq!(*order.lock(), vec!["start:a", "start:b", "stop:b", "stop:a"]);
    }

    #[tokio::test]
    async fn shutdown_runs_every_step_even_if_one_errors() {
        let attempted = Arc::new(AtomicUsize::new(0));
        let mut coordinator = Coordinator::new();
        for (name, priority) in [("a", 1), ("b", 2), ("c", 3)] {
            let attempted = Arc::clone(&attempted);
            coordinator.register(LifecycleStep::new(
                name,
                priority,
                Arc::new(|| Box::pin(async { Ok(()) })),
                Arc::new(move || {
                    let attempted = Arc::clone(&attempted);
                    Box::pin(async move {
                        attempted.fetch_add(1, Ordering::Relaxed);
                        if attempted.load(Ordering::Relaxed) == 2 {
                            Err(MantisError::Internal("stop failed".to_string()))
                        } else {
                            Ok(())
                        }
                    })
                }),
            ));
        }
        let errors = coordinator.shutdown().await;
        assert_eq!(attempted.load(Ordering::Relaxed), 3);
        assert_eq!(errors.len(), 1);
    }
}
