// Execution results and the run report

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{EngineError, ErrorKind};

/// Exit code for a fully successful run
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for configuration, inventory or plan errors
pub const EXIT_CONFIG_ERROR: i32 = 1;
/// Exit code when at least one host ended failed or unreachable
pub const EXIT_HOST_FAILURE: i32 = 2;
/// Exit code when the run was cancelled
pub const EXIT_CANCELLED: i32 = 130;

/// Outcome class of one (task, host) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Changed,
    Unchanged,
    Failed,
    Skipped,
    Errored,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Changed => "changed",
            ResultStatus::Unchanged => "unchanged",
            ResultStatus::Failed => "failed",
            ResultStatus::Skipped => "skipped",
            ResultStatus::Errored => "errored",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task on one host. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Position of the task in the plan
    pub task_index: usize,
    pub task_name: String,
    pub host: String,
    pub status: ResultStatus,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, bounded
    pub output: String,
    pub truncated: bool,
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    fn base(task_index: usize, task_name: &str, host: &str, status: ResultStatus) -> Self {
        ExecutionResult {
            task_index,
            task_name: task_name.to_string(),
            host: host.to_string(),
            status,
            error: None,
            message: None,
            exit_code: None,
            output: String::new(),
            truncated: false,
            attempts: 0,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn changed(task_index: usize, task_name: &str, host: &str) -> Self {
        Self::base(task_index, task_name, host, ResultStatus::Changed)
    }

    pub fn unchanged(task_index: usize, task_name: &str, host: &str) -> Self {
        Self::base(task_index, task_name, host, ResultStatus::Unchanged)
    }

    pub fn failed(
        task_index: usize,
        task_name: &str,
        host: &str,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let mut r = Self::base(task_index, task_name, host, ResultStatus::Failed);
        r.error = Some(kind);
        r.message = Some(message.into());
        r
    }

    pub fn skipped(task_index: usize, task_name: &str, host: &str, message: impl Into<String>) -> Self {
        let mut r = Self::base(task_index, task_name, host, ResultStatus::Skipped);
        r.message = Some(message.into());
        r
    }

    /// Build the terminal result for an error that survived the retry controller
    pub fn from_error(task_index: usize, task_name: &str, host: &str, err: &EngineError) -> Self {
        let kind = err.kind().unwrap_or(ErrorKind::TransportError);
        // Timeouts are task-level failures even after retrying them
        let status = if kind == ErrorKind::Timeout {
            ResultStatus::Failed
        } else {
            ResultStatus::Errored
        };
        let mut r = Self::base(task_index, task_name, host, status);
        r.error = Some(kind);
        r.message = Some(err.to_string());
        r
    }

    pub fn cancelled(task_index: usize, task_name: &str, host: &str) -> Self {
        let mut r = Self::base(task_index, task_name, host, ResultStatus::Errored);
        r.error = Some(ErrorKind::Cancelled);
        r.message = Some("cancelled while in flight".to_string());
        r
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>, truncated: bool) -> Self {
        self.output = output.into();
        self.truncated = truncated;
        self
    }

    pub fn with_error(mut self, kind: ErrorKind) -> Self {
        self.error = Some(kind);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == Some(ErrorKind::Cancelled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, ResultStatus::Failed | ResultStatus::Errored)
    }
}

/// Cumulative status of a host within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    #[default]
    Ok,
    Failed,
    Unreachable,
}

impl HostState {
    pub fn is_excluded(&self) -> bool {
        !matches!(self, HostState::Ok)
    }
}

/// Per-host counters, like an Ansible play recap line
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
}

impl HostStats {
    pub fn record(&mut self, result: &ExecutionResult) {
        match result.status {
            ResultStatus::Changed => self.changed += 1,
            ResultStatus::Unchanged => self.unchanged += 1,
            ResultStatus::Failed => self.failed += 1,
            ResultStatus::Skipped => self.skipped += 1,
            ResultStatus::Errored => self.errored += 1,
        }
    }
}

/// Final state of a host in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub state: HostState,
    pub stats: HostStats,
}

/// Aggregation of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Every inventory host, keyed by name
    pub hosts: BTreeMap<String, HostSummary>,
    /// Results grouped by task index, in plan order of hosts as recorded
    pub tasks: BTreeMap<usize, Vec<ExecutionResult>>,
    /// All results in completion order
    pub log: Vec<ExecutionResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    /// Events lost by lagging observers
    pub dropped_events: u64,
}

impl RunReport {
    pub fn overall_success(&self) -> bool {
        !self.cancelled && self.hosts.values().all(|h| h.state == HostState::Ok)
    }

    pub fn is_final(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.overall_success() {
            EXIT_SUCCESS
        } else {
            EXIT_HOST_FAILURE
        }
    }

    pub fn host_state(&self, host: &str) -> Option<HostState> {
        self.hosts.get(host).map(|h| h.state)
    }

    pub fn result(&self, task_index: usize, host: &str) -> Option<&ExecutionResult> {
        self.tasks
            .get(&task_index)
            .and_then(|results| results.iter().find(|r| r.host == host))
    }

    pub fn total_changed(&self) -> usize {
        self.hosts.values().map(|h| h.stats.changed).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.hosts
            .values()
            .map(|h| h.stats.failed + h.stats.errored)
            .sum()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
