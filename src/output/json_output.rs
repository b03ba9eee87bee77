// JSON output for structured logging

use std::collections::BTreeMap;

use serde_json::json;

use super::errors::EngineError;
use super::report::{ExecutionResult, RunReport};

/// JSON output manager for machine-readable logging (one object per line)
pub struct JsonOutput {
    verbose: bool,
    quiet: bool,
}

impl JsonOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        JsonOutput { verbose, quiet }
    }

    pub fn run_header_event(
        &self,
        plan: &str,
        tasks: usize,
        hosts: usize,
        units: usize,
    ) -> serde_json::Value {
        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "run_start",
            "plan": plan,
            "tasks": tasks,
            "hosts_count": hosts,
            "units": units,
        })
    }

    pub fn print_run_header(&self, plan: &str, tasks: usize, hosts: usize, units: usize) {
        if self.quiet {
            return;
        }
        self.emit_json(&self.run_header_event(plan, tasks, hosts, units));
    }

    pub fn result_event(&self, result: &ExecutionResult) -> serde_json::Value {
        let mut event = json!({
            "timestamp": result.timestamp.to_rfc3339(),
            "event": "task_complete",
            "task_index": result.task_index,
            "task": result.task_name,
            "host": result.host,
            "status": result.status.as_str(),
            "attempts": result.attempts,
            "duration_ms": result.duration.as_millis() as u64,
        });

        if let Some(obj) = event.as_object_mut() {
            if let Some(kind) = result.error {
                obj.insert("error".to_string(), json!(kind));
            }
            if let Some(ref message) = result.message {
                obj.insert("message".to_string(), json!(message));
            }
            if let Some(code) = result.exit_code {
                obj.insert("exit_code".to_string(), json!(code));
            }
            if (self.verbose || result.is_failure()) && !result.output.is_empty() {
                obj.insert("output".to_string(), json!(result.output));
                obj.insert("truncated".to_string(), json!(result.truncated));
            }
        }

        event
    }

    /// Print a task result for a host
    pub fn print_result(&self, result: &ExecutionResult) {
        if self.quiet && !result.is_failure() {
            return;
        }
        self.emit_json(&self.result_event(result));
    }

    pub fn recap_event(&self, report: &RunReport) -> serde_json::Value {
        let hosts: BTreeMap<&str, serde_json::Value> = report
            .hosts
            .iter()
            .map(|(host, summary)| {
                (
                    host.as_str(),
                    json!({
                        "state": summary.state,
                        "ok": summary.stats.unchanged,
                        "changed": summary.stats.changed,
                        "failed": summary.stats.failed,
                        "errored": summary.stats.errored,
                        "skipped": summary.stats.skipped,
                    }),
                )
            })
            .collect();

        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "run_complete",
            "started_at": report.started_at.to_rfc3339(),
            "finished_at": report.finished_at.map(|t| t.to_rfc3339()),
            "hosts": hosts,
            "total_duration_ms": report.duration().map(|d| d.as_millis() as u64),
            "total_failed": report.total_failed(),
            "total_changed": report.total_changed(),
            "cancelled": report.cancelled,
            "dropped_events": report.dropped_events,
            "success": report.overall_success(),
            "exit_code": report.exit_code(),
        })
    }

    /// Print the run recap summary
    pub fn print_recap(&self, report: &RunReport) {
        self.emit_json(&self.recap_event(report));
    }

    pub fn print_error(&self, err: &EngineError) {
        self.emit_json(&json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "error",
            "message": err.to_string(),
            "suggestion": err.suggestion(),
        }));
    }

    /// Emit a JSON object as a single line (NDJSON format)
    fn emit_json(&self, value: &serde_json::Value) {
        if let Ok(json_str) = serde_json::to_string(value) {
            println!("{}", json_str);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::errors::ErrorKind;
    use crate::output::report::{HostState, HostSummary};
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_run_header_counts_units() {
        let event = JsonOutput::new(false, false).run_header_event("plan.yaml", 2, 3, 4);
        assert_eq!(event["event"], "run_start");
        assert_eq!(event["tasks"], 2);
        assert_eq!(event["hosts_count"], 3);
        assert_eq!(event["units"], 4);
    }

    #[test]
    fn test_result_event_fields() {
        let output = JsonOutput::new(false, false);
        let result = ExecutionResult::failed(2, "deploy", "web1", ErrorKind::ModuleFailed, "exit 1")
            .with_exit_code(1)
            .with_output("boom", false)
            .with_attempts(1)
            .with_duration(Duration::from_millis(1234));

        let event = output.result_event(&result);
        assert_eq!(event["event"], "task_complete");
        assert_eq!(event["status"], "failed");
        assert_eq!(event["error"], "module_failed");
        assert_eq!(event["exit_code"], 1);
        assert_eq!(event["duration_ms"], 1234);
        assert_eq!(event["output"], "boom");
    }

    #[test]
    fn test_output_hidden_for_success_unless_verbose() {
        let result = ExecutionResult::changed(0, "t", "h").with_output("noise", false);
        assert!(JsonOutput::new(false, false).result_event(&result).get("output").is_none());
        assert_eq!(JsonOutput::new(true, false).result_event(&result)["output"], "noise");
    }

    #[test]
    fn test_recap_event() {
        let mut report = RunReport {
            hosts: Default::default(),
            tasks: Default::default(),
            log: Vec::new(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            cancelled: false,
            dropped_events: 0,
        };
        report.hosts.insert(
            "db1".to_string(),
            HostSummary {
                state: HostState::Unreachable,
                stats: Default::default(),
            },
        );

        let event = JsonOutput::new(false, false).recap_event(&report);
        assert_eq!(event["event"], "run_complete");
        assert_eq!(event["hosts"]["db1"]["state"], "unreachable");
        assert_eq!(event["success"], false);
        assert_eq!(event["exit_code"], 2);
    }
}
