// Output module: errors, results, events and renderers

pub mod errors;
pub mod events;
pub mod json_output;
pub mod report;
pub mod terminal;

pub use errors::*;
pub use events::*;
pub use json_output::*;
pub use report::*;
pub use terminal::*;

/// Output format for Catalyst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON output (NDJSON format)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}' (expected text or json)", other)),
        }
    }
}

/// Unified output writer supporting both text and JSON formats
pub enum OutputWriter {
    Text(TerminalOutput),
    Json(JsonOutput),
}

impl OutputWriter {
    pub fn new(format: OutputFormat, verbose: bool, quiet: bool) -> Self {
        match format {
            OutputFormat::Text => OutputWriter::Text(TerminalOutput::new(verbose, quiet)),
            OutputFormat::Json => OutputWriter::Json(JsonOutput::new(verbose, quiet)),
        }
    }

    pub fn print_run_header(&mut self, plan: &str, tasks: usize, hosts: usize, units: usize) {
        match self {
            OutputWriter::Text(output) => output.print_run_header(plan, tasks, hosts, units),
            OutputWriter::Json(output) => output.print_run_header(plan, tasks, hosts, units),
        }
    }

    pub fn print_result(&mut self, result: &ExecutionResult) {
        match self {
            OutputWriter::Text(output) => output.print_result(result),
            OutputWriter::Json(output) => output.print_result(result),
        }
    }

    pub fn print_recap(&mut self, report: &RunReport) {
        match self {
            OutputWriter::Text(output) => output.print_recap(report),
            OutputWriter::Json(output) => output.print_recap(report),
        }
    }

    pub fn print_error(&mut self, err: &EngineError) {
        match self {
            OutputWriter::Text(output) => output.print_error(err),
            OutputWriter::Json(output) => output.print_error(err),
        }
    }
}
