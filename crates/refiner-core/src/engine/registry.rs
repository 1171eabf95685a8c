use crate::dataset::Dataset;
use crate::engine::control::{Phase, RunControl};
use crate::engine::pipeline::Pipeline;
use crate::errors::InvalidStateError;
use crate::events::{EventBus, EventStream};
use crate::model::{NewRun, RunStatus};
use crate::providers::registry::ProviderRegistry;
use crate::storage::Store;
use crate::template;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

struct RunHandle {
    control: Arc<RunControl>,
    task: Option<JoinHandle<anyhow::Result<RunStatus>>>,
}

type RunMap = Arc<Mutex<HashMap<i64, RunHandle>>>;

fn lock_runs(runs: &Mutex<HashMap<i64, RunHandle>>) -> MutexGuard<'_, HashMap<i64, RunHandle>> {
    runs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Process-wide supervisor of active runs: one orchestrator task per run,
/// plus the control handle used for stop and feedback. A run's entry is
/// dropped once its orchestrator exits; the store answers for it from then on.
pub struct RunRegistry {
    pipeline: Arc<Pipeline>,
    feedback_timeout: Duration,
    runs: RunMap,
}

impl RunRegistry {
    pub fn new(
        store: Store,
        events: EventBus,
        providers: Arc<ProviderRegistry>,
        feedback_timeout: Duration,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store,
                events,
                providers,
            }),
            feedback_timeout,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, RunHandle>> {
        lock_runs(&self.runs)
    }

    pub fn store(&self) -> &Store {
        &self.pipeline.store
    }

    pub fn events(&self) -> &EventBus {
        &self.pipeline.events
    }

    /// Validate, persist as `pending` and launch. Returns as soon as the run
    /// row exists; no stage has executed yet.
    pub fn create_and_launch(&self, run: &NewRun, dataset: Dataset) -> anyhow::Result<i64> {
        run.config.validate()?;
        dataset.validate()?;
        if run.config.enforce_placeholders {
            template::check_columns(&run.initial_prompt, &dataset.input_columns())?;
        }
        let run_id = self.pipeline.store.create_run(run)?;
        self.launch(run_id, dataset)?;
        Ok(run_id)
    }

    /// Schedule the orchestrator for a persisted `pending` run. Must be called
    /// from within a tokio runtime.
    pub fn launch(&self, run_id: i64, dataset: Dataset) -> anyhow::Result<()> {
        let mut runs = self.lock();
        if runs.contains_key(&run_id) {
            return Err(InvalidStateError::AlreadyLaunched(run_id).into());
        }
        let run = self
            .pipeline
            .store
            .get_run(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run {} not found", run_id))?;
        if run.status != RunStatus::Pending {
            return Err(InvalidStateError::WrongStatus {
                run_id,
                status: run.status.to_string(),
                expected: RunStatus::Pending.to_string(),
            }
            .into());
        }

        let control = Arc::new(RunControl::new(run_id, self.feedback_timeout));
        let pipeline = self.pipeline.clone();
        let task_control = control.clone();
        let task_runs = self.runs.clone();
        let task = tokio::spawn(async move {
            let res = pipeline.execute(run_id, dataset, task_control).await;
            if let Err(e) = &res {
                tracing::error!(event = "run_aborted", run_id, error = %e, "orchestrator exited with error");
            }
            lock_runs(&task_runs).remove(&run_id);
            res
        });
        tracing::info!(run_id, name = %run.name, "run launched");
        runs.insert(
            run_id,
            RunHandle {
                control,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Request a cooperative stop. Repeating the request is harmless; asking
    /// for a run that is not active is an error.
    pub fn stop(&self, run_id: i64) -> Result<(), InvalidStateError> {
        let control = self.active_control(run_id)?;
        control.request_stop();
        tracing::info!(run_id, "stop requested");
        Ok(())
    }

    pub fn submit_feedback(
        &self,
        run_id: i64,
        text: impl Into<String>,
    ) -> Result<(), InvalidStateError> {
        self.active_control(run_id)?.submit_feedback(text)
    }

    /// In-memory phase of an active run; `None` once its orchestrator exited
    /// or for runs this process never launched.
    pub fn phase(&self, run_id: i64) -> Option<Phase> {
        self.lock().get(&run_id).map(|h| h.control.phase())
    }

    /// Live events of a run. Runs that are unknown or already terminal get a
    /// stream that ends immediately.
    pub fn subscribe(&self, run_id: i64) -> EventStream {
        match self.pipeline.store.get_run(run_id) {
            Ok(Some(run)) if !run.status.is_terminal() => self.pipeline.events.subscribe(run_id),
            Ok(_) => EventStream::ended(run_id),
            Err(e) => {
                tracing::warn!(event = "subscribe_failed", run_id, error = %e, "cannot read run status");
                EventStream::ended(run_id)
            }
        }
    }

    /// Await the run's orchestrator and return its terminal status. For a run
    /// whose orchestrator already exited (or never launched here) the stored
    /// status is returned.
    pub async fn wait(&self, run_id: i64) -> anyhow::Result<RunStatus> {
        let task = self.lock().get_mut(&run_id).and_then(|h| h.task.take());
        match task {
            Some(task) => task.await?,
            None => self
                .pipeline
                .store
                .get_run(run_id)?
                .map(|r| r.status)
                .ok_or_else(|| anyhow::anyhow!("run {} not found", run_id)),
        }
    }

    /// Stop every active run and wait for all orchestrators to exit.
    pub async fn shutdown(&self) {
        let tasks: Vec<(i64, JoinHandle<anyhow::Result<RunStatus>>)> = {
            let mut runs = self.lock();
            runs.iter_mut()
                .filter_map(|(id, h)| {
                    h.control.request_stop();
                    h.task.take().map(|t| (*id, t))
                })
                .collect()
        };
        for (run_id, task) in tasks {
            match task.await {
                Ok(Ok(status)) => tracing::debug!(run_id, %status, "run shut down"),
                Ok(Err(e)) => tracing::warn!(run_id, error = %e, "run ended with error during shutdown"),
                Err(e) => tracing::warn!(run_id, error = %e, "run task panicked during shutdown"),
            }
        }
    }

    fn active_control(&self, run_id: i64) -> Result<Arc<RunControl>, InvalidStateError> {
        let runs = self.lock();
        match runs.get(&run_id) {
            Some(h) if h.control.phase() != Phase::Finished => Ok(h.control.clone()),
            _ => Err(InvalidStateError::NotActive(run_id)),
        }
    }
}
