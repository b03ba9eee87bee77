// Result aggregation and host state tracking

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::output::errors::ErrorKind;
use crate::output::events::{EventEmitter, EventReceiver};
use crate::output::report::{
    ExecutionResult, HostState, HostSummary, ResultStatus, RunReport,
};

/// Collects every result of a run.
///
/// The scheduler reads [`host_state`](Self::host_state) before each
/// dispatch; only recorded results write it.
pub struct ResultAggregator {
    state: Mutex<RunReport>,
    events: EventEmitter,
}

impl ResultAggregator {
    pub fn new(event_buffer: usize) -> Self {
        ResultAggregator {
            state: Mutex::new(RunReport {
                hosts: Default::default(),
                tasks: Default::default(),
                log: Vec::new(),
                started_at: Utc::now(),
                finished_at: None,
                cancelled: false,
                dropped_events: 0,
            }),
            events: EventEmitter::new(event_buffer),
        }
    }

    /// Make every host appear in the report, even if no task selects it
    pub fn register_hosts<'a>(&self, hosts: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state.lock();
        for host in hosts {
            state
                .hosts
                .entry(host.to_string())
                .or_insert_with(|| HostSummary {
                    state: HostState::Ok,
                    stats: Default::default(),
                });
        }
    }

    /// Record a result whose host was reachable, or failed after connecting
    pub fn record(&self, result: ExecutionResult) {
        self.insert(result, false);
    }

    /// Record a result for a host no session could be established with
    pub fn record_unreachable(&self, result: ExecutionResult) {
        self.insert(result, true);
    }

    fn insert(&self, result: ExecutionResult, unreachable: bool) {
        {
            let mut state = self.state.lock();
            let summary = state
                .hosts
                .entry(result.host.clone())
                .or_insert_with(|| HostSummary {
                    state: HostState::Ok,
                    stats: Default::default(),
                });

            summary.stats.record(&result);

            let next = match result.status {
                _ if result.error == Some(ErrorKind::Cancelled) => None,
                ResultStatus::Failed | ResultStatus::Errored if unreachable => {
                    Some(HostState::Unreachable)
                }
                ResultStatus::Failed | ResultStatus::Errored => Some(HostState::Failed),
                _ => None,
            };

            if let Some(next) = next {
                if summary.state == HostState::Ok {
                    warn!(host = %result.host, task = %result.task_name, state = ?next, "host excluded from remaining tasks");
                    summary.state = next;
                }
            }

            state
                .tasks
                .entry(result.task_index)
                .or_default()
                .push(result.clone());
            state.log.push(result.clone());
        }

        self.events.emit(&result);
    }

    pub fn host_state(&self, host: &str) -> HostState {
        self.state
            .lock()
            .hosts
            .get(host)
            .map(|h| h.state)
            .unwrap_or_default()
    }

    pub fn mark_cancelled(&self) {
        self.state.lock().cancelled = true;
    }

    /// Stamp the end time. Later calls keep the first stamp.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.finished_at.is_none() {
            state.finished_at = Some(Utc::now());
        }
    }

    /// Snapshot of the run; partial until [`finish`](Self::finish)
    pub fn report(&self) -> RunReport {
        let mut report = self.state.lock().clone();
        report.dropped_events = self.events.dropped();
        report
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
