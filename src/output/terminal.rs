// Rich terminal output for Catalyst

use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

use super::errors::EngineError;
use super::report::{ExecutionResult, HostState, HostSummary, ResultStatus, RunReport};

/// Terminal output manager
pub struct TerminalOutput {
    progress: Option<ProgressBar>,
    last_task: Option<usize>,
    verbose: bool,
    quiet: bool,
    is_tty: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        let is_tty = console::Term::stdout().is_term();

        // Respect NO_COLOR environment variable (https://no-color.org/)
        // Also disable colors if not a TTY
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput {
            progress: None,
            last_task: None,
            verbose,
            quiet,
            is_tty,
        }
    }

    /// Print a header for a run; the progress bar counts `units`
    pub fn print_run_header(&mut self, plan: &str, tasks: usize, hosts: usize, units: usize) {
        if self.quiet {
            return;
        }

        println!();
        println!(
            "{} {} ({} tasks, {} hosts)",
            "RUN".green().bold(),
            plan.cyan(),
            tasks,
            hosts
        );
        println!("{}", "─".repeat(60).dimmed());

        if self.is_tty && units > 0 {
            let pb = ProgressBar::new(units as u64);
            if let Ok(style) =
                ProgressStyle::default_bar().template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            {
                pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            self.progress = Some(pb);
        }
    }

    fn line(&self, text: String) {
        match &self.progress {
            Some(pb) => pb.println(text),
            None => println!("{}", text),
        }
    }

    /// Print one result, with a task header when a new task begins
    pub fn print_result(&mut self, result: &ExecutionResult) {
        if let Some(pb) = &self.progress {
            pb.inc(1);
            pb.set_message(result.task_name.clone());
        }

        if self.quiet && !result.is_failure() {
            return;
        }

        if self.last_task != Some(result.task_index) {
            self.last_task = Some(result.task_index);
            self.line(String::new());
            self.line(format!(
                "{} [{}] {}",
                "TASK".yellow().bold(),
                result.task_index + 1,
                result.task_name
            ));
        }

        let mut header = format!(
            "  {} {} {}",
            status_label(result),
            "=>".dimmed(),
            result.host.white().bold()
        );
        if result.attempts > 1 {
            header.push_str(&format!(" {}", format!("({} attempts)", result.attempts).dimmed()));
        }
        self.line(header);

        if self.verbose || result.is_failure() {
            for line in result.output.lines() {
                self.line(format!("      {}", line.dimmed()));
            }
            if result.truncated {
                self.line(format!("      {}", "[output truncated]".dimmed()));
            }
        }

        if let Some(msg) = &result.message {
            if !msg.is_empty() && (self.verbose || result.status != ResultStatus::Changed) {
                self.line(format!("      {}", msg));
            }
        }
    }

    /// Print the run recap summary
    pub fn print_recap(&mut self, report: &RunReport) {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }

        if self.quiet && report.overall_success() {
            return;
        }

        println!();
        println!("{}", "RUN RECAP".green().bold());
        println!("{}", "─".repeat(60).dimmed());

        for (host, summary) in &report.hosts {
            println!("{}", recap_line(host, summary));
        }

        println!();
        if report.cancelled {
            println!("{}", "Run cancelled".red().bold());
        }
        if report.dropped_events > 0 {
            println!(
                "{}",
                format!("{} events dropped by slow observers", report.dropped_events).dimmed()
            );
        }
        if let Some(d) = report.duration() {
            println!("Total time: {:.2}s", d.as_secs_f64());
        }
    }

    pub fn print_error(&mut self, err: &EngineError) {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
        eprintln!("{} {}", "ERROR".red().bold(), err);
        if let Some(suggestion) = err.suggestion() {
            eprintln!("  {} {}", "hint:".cyan(), suggestion);
        }
    }
}

fn status_label(result: &ExecutionResult) -> ColoredString {
    match result.status {
        ResultStatus::Changed => "CHANGED".yellow(),
        ResultStatus::Unchanged => "OK".green(),
        ResultStatus::Skipped => "SKIPPED".cyan(),
        ResultStatus::Failed => "FAILED".red().bold(),
        ResultStatus::Errored if result.is_cancelled() => "CANCELLED".magenta(),
        ResultStatus::Errored => "ERROR".red().bold(),
    }
}

fn recap_line(host: &str, summary: &HostSummary) -> String {
    let stats = &summary.stats;
    let ok = format!("ok={}", stats.unchanged).green();
    let changed = if stats.changed > 0 {
        format!("changed={}", stats.changed).yellow()
    } else {
        format!("changed={}", stats.changed).normal()
    };
    let failed = if stats.failed + stats.errored > 0 {
        format!("failed={}", stats.failed + stats.errored).red().bold()
    } else {
        format!("failed={}", 0).normal()
    };
    let skipped = format!("skipped={}", stats.skipped).cyan();
    let state = match summary.state {
        HostState::Ok => String::new(),
        HostState::Failed => format!("  {}", "[failed]".red()),
        HostState::Unreachable => format!("  {}", "[unreachable]".red().bold()),
    };

    format!(
        "{:<30} : {}    {}    {}    {}{}",
        host.white().bold(),
        ok,
        changed,
        failed,
        skipped,
        state
    )
}
