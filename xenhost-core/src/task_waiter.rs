//! Tracking of long-running hypervisor tasks
//!
//! Migrations, snapshot reverts and provisioning run as server-side tasks.
//! [`TaskWaiter`] submits them, polls their status on a fixed interval and
//! reports how they ended. A wait that runs out of budget ends in
//! [`TerminalStatus::TimedOut`], which means the remote outcome is unknown and
//! callers must not assume the task failed or was cleaned up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_TASK_POLL_INTERVAL_MS, DEFAULT_TASK_WAIT_SECS};
use crate::error::{XenhostError, XenhostResult};
use crate::hypervisor::{AsyncOperation, HypervisorApi, RemoteTaskStatus, TaskRef};

/// Local view of a remote task's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    Failed { error: String },
    Cancelled,
    /// Budget exhausted; the remote task may still complete
    TimedOut { elapsed: Duration },
}

/// Cooperative cancellation request shared with a waiting caller
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    pub task: TaskRef,
    pub operation: String,
    pub submitted_at: Instant,
    pub poll_interval: Duration,
    pub timeout: Duration,
    state: TaskState,
    polls: u32,
    failure: Option<String>,
    result: Option<String>,
    elapsed: Duration,
    cancel_sent: bool,
}

impl TaskHandle {
    fn new(task: TaskRef, operation: &str) -> Self {
        Self {
            task,
            operation: operation.to_string(),
            submitted_at: Instant::now(),
            poll_interval: Duration::from_millis(DEFAULT_TASK_POLL_INTERVAL_MS),
            timeout: Duration::from_secs(DEFAULT_TASK_WAIT_SECS),
            state: TaskState::Pending,
            polls: 0,
            failure: None,
            result: None,
            elapsed: Duration::ZERO,
            cancel_sent: false,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Number of remote status queries made for this task
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Remote error detail of a failed task
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self.state {
            TaskState::Pending | TaskState::Running => None,
            TaskState::Succeeded => Some(TerminalStatus::Succeeded),
            TaskState::Failed => Some(TerminalStatus::Failed {
                error: self.failure.clone().unwrap_or_default(),
            }),
            TaskState::Cancelled => Some(TerminalStatus::Cancelled),
            TaskState::TimedOut => Some(TerminalStatus::TimedOut {
                elapsed: self.elapsed,
            }),
        }
    }
}

pub struct TaskWaiter {
    api: Arc<dyn HypervisorApi>,
}

impl TaskWaiter {
    pub fn new(api: Arc<dyn HypervisorApi>) -> Self {
        Self { api }
    }

    pub async fn submit(&self, operation: &AsyncOperation) -> XenhostResult<TaskHandle> {
        let task = self.api.submit(operation).await?;
        debug!("Submitted {} as task {}", operation.label(), task);
        Ok(TaskHandle::new(task, operation.label()))
    }

    /// Query the remote status once. Terminal handles are not polled again.
    pub async fn poll(&self, handle: &mut TaskHandle) -> XenhostResult<TaskState> {
        if handle.state.is_terminal() {
            return Ok(handle.state);
        }

        let status = self.api.task_status(&handle.task).await?;
        handle.polls += 1;
        handle.state = match status {
            RemoteTaskStatus::Pending | RemoteTaskStatus::Cancelling => TaskState::Running,
            RemoteTaskStatus::Success => TaskState::Succeeded,
            RemoteTaskStatus::Cancelled => TaskState::Cancelled,
            RemoteTaskStatus::Failure { error_info } => {
                handle.failure = Some(error_info.join(" "));
                TaskState::Failed
            }
        };
        debug!(
            task = %handle.task,
            polls = handle.polls,
            "{} is {:?}",
            handle.operation,
            handle.state
        );
        Ok(handle.state)
    }

    /// Poll until the task is terminal or `timeout` has elapsed
    ///
    /// A set cancellation flag sends one cancel request to the server; the
    /// loop keeps polling until the server reports a terminal status.
    pub async fn await_completion(
        &self,
        handle: &mut TaskHandle,
        poll_interval: Duration,
        timeout: Duration,
        cancel: Option<&CancellationFlag>,
    ) -> XenhostResult<TerminalStatus> {
        handle.poll_interval = poll_interval;
        handle.timeout = timeout;
        let started = Instant::now();

        loop {
            if let Some(status) = handle.terminal_status() {
                return Ok(status);
            }

            sleep(poll_interval).await;

            if cancel.map_or(false, CancellationFlag::is_cancelled) && !handle.cancel_sent {
                info!("Cancellation requested for {} ({})", handle.operation, handle.task);
                self.request_cancel(handle).await;
            }

            let state = match self.poll(handle).await {
                Ok(state) => state,
                Err(e) => {
                    self.destroy(handle).await;
                    return Err(e);
                }
            };
            if state.is_terminal() {
                if state == TaskState::Succeeded {
                    match self.api.task_result(&handle.task).await {
                        Ok(result) => handle.result = result,
                        Err(e) => {
                            self.destroy(handle).await;
                            return Err(e);
                        }
                    }
                }
                self.destroy(handle).await;
                return Ok(handle.terminal_status().unwrap_or(TerminalStatus::Cancelled));
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                handle.state = TaskState::TimedOut;
                handle.elapsed = elapsed;
                warn!(
                    task = %handle.task,
                    "{} did not finish within {:?}, outcome unknown",
                    handle.operation,
                    timeout
                );
                self.request_cancel(handle).await;
                return Ok(TerminalStatus::TimedOut { elapsed });
            }
        }
    }

    /// Result reference of a succeeded task
    pub fn task_result(&self, handle: &TaskHandle) -> XenhostResult<Option<String>> {
        match handle.state {
            TaskState::Succeeded => Ok(handle.result.clone()),
            state => Err(XenhostError::internal(format!(
                "result of {} requested while task is {:?}",
                handle.operation, state
            ))),
        }
    }

    /// Submit, wait and turn anything but success into an error
    pub async fn run(
        &self,
        operation: &AsyncOperation,
        poll_interval: Duration,
        timeout: Duration,
        cancel: Option<&CancellationFlag>,
    ) -> XenhostResult<Option<String>> {
        let mut handle = self.submit(operation).await?;
        match self
            .await_completion(&mut handle, poll_interval, timeout, cancel)
            .await?
        {
            TerminalStatus::Succeeded => self.task_result(&handle),
            TerminalStatus::Failed { error } => Err(XenhostError::TaskFailed {
                operation: handle.operation,
                detail: error,
            }),
            TerminalStatus::Cancelled => Err(XenhostError::TaskCancelled {
                operation: handle.operation,
            }),
            TerminalStatus::TimedOut { elapsed } => Err(XenhostError::Timeout {
                operation: handle.operation,
                duration: elapsed,
            }),
        }
    }

    async fn request_cancel(&self, handle: &mut TaskHandle) {
        if handle.cancel_sent {
            return;
        }
        handle.cancel_sent = true;
        if let Err(e) = self.api.cancel_task(&handle.task).await {
            warn!("Failed to request cancel of {}: {}", handle.task, e);
        }
    }

    async fn destroy(&self, handle: &TaskHandle) {
        if let Err(e) = self.api.destroy_task(&handle.task).await {
            debug!("Failed to destroy task {}: {}", handle.task, e);
        }
    }
}
