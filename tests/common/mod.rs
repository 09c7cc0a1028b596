//! Shared fakes for integration tests: a scripted transport for the client
//! and a recording runner for the pool.

#![allow(dead_code)]

use async_trait::async_trait;
use autoforge::{
    ApiRequest, ApiResponse, ChangeRequest, Task, TaskRunner, TaskSubmission, TaskSuccess,
    Transport, TransportError, WorkerError, WorkerPhase, WorkerRetryState,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted wire interaction.
pub enum ScriptStep {
    Respond(ApiResponse),
    NetworkError(String),
}

/// Transport that replays a fixed script and counts every send.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").field("calls", &self.calls()).finish()
    }
}

impl ScriptedTransport {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self { steps: Mutex::new(steps.into()), calls: AtomicUsize::new(0) }
    }

    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, _request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.steps.lock().unwrap().pop_front() {
            Some(ScriptStep::Respond(response)) => Ok(response),
            Some(ScriptStep::NetworkError(message)) => Err(TransportError::Network(message)),
            None => Err(TransportError::Network("script exhausted".into())),
        }
    }
}

pub fn response(status: u16, headers: &[(&str, &str)], body: Value) -> ApiResponse {
    ApiResponse {
        status,
        headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        body,
    }
}

pub fn ok(body: Value) -> ScriptStep {
    ScriptStep::Respond(response(200, &[], body))
}

pub fn status(code: u16, headers: &[(&str, &str)], body: Value) -> ScriptStep {
    ScriptStep::Respond(response(code, headers, body))
}

/// Runner that records execution order and completes according to a script.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub order: Mutex<Vec<u64>>,
    /// Issue numbers that fail every attempt.
    pub fail_numbers: Vec<u64>,
    /// Per-issue remaining failure budget; fails while the count is > 0.
    pub flaky: Mutex<HashMap<u64, u32>>,
    pub delay: Option<Duration>,
}

impl RecordingRunner {
    pub fn order(&self) -> Vec<u64> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(
        &self,
        task: &Task,
        state: &WorkerRetryState,
        _worker_id: u32,
    ) -> Result<TaskSuccess, WorkerError> {
        self.order.lock().unwrap().push(task.request.number);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let flaky_failure = {
            let mut flaky = self.flaky.lock().unwrap();
            match flaky.get_mut(&task.request.number) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        if flaky_failure || self.fail_numbers.contains(&task.request.number) {
            Err(WorkerError::new(
                WorkerPhase::Execute,
                state.branch_name.as_str(),
                "/tmp/ws",
                Duration::from_millis(1),
                autoforge::ForgeError::new(autoforge::ErrorKind::Server, "scripted failure"),
            ))
        } else {
            Ok(TaskSuccess {
                commit_sha: Some(format!("sha-{}", task.request.number)),
                duration: Duration::from_millis(1),
                no_changes: false,
            })
        }
    }
}

pub fn submission(number: u64, labels: &[&str], body: &str) -> TaskSubmission {
    TaskSubmission {
        request: ChangeRequest {
            number,
            title: format!("task {number}"),
            body: body.to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
        },
        branch_name: format!("autoforge/task-{number}"),
    }
}
