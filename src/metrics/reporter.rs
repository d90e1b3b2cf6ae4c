use super::{RunOutcome, RunReport};
use crate::error::HarnessError;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Formats progress lines and the final run summary.
pub struct ResultsReporter;

impl ResultsReporter {
    /// One throughput figure per worker, in population order.
    pub fn qps_line(counts: &[u64], interval: Duration) -> String {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        let rates: Vec<String> = counts
            .iter()
            .map(|&n| format!("{:05.1}", n as f64 / secs))
            .collect();
        format!("QPS: {}", rates.join(" "))
    }

    pub fn summary(report: &RunReport) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Queries executed: {} ({:.0}% failed)",
            report.queries_executed, report.failure_percentage
        );
        let _ = writeln!(out, "Error statistics:");
        for (error, per_action) in report.errors.iter() {
            let text: Vec<String> = per_action
                .iter()
                .map(|(action, count)| format!("{action}: {count}"))
                .collect();
            let _ = writeln!(out, "  {error}: {}", text.join(", "));
        }

        let latency = &report.latency;
        if latency.samples > 0 {
            let _ = writeln!(
                out,
                "Latency (us): p50={} p95={} p99={} p99.9={} max={}",
                latency.p50_us, latency.p95_us, latency.p99_us, latency.p999_us, latency.max_us
            );
        }

        match &report.outcome {
            RunOutcome::Completed => {}
            RunOutcome::Interrupted => {
                let _ = writeln!(out, "Run interrupted");
            }
            RunOutcome::Failed { thread, error } => {
                let _ = writeln!(out, "Thread {thread} failed: {error}");
            }
        }
        out
    }

    pub fn print_summary(report: &RunReport) {
        print!("{}", Self::summary(report));
    }

    pub fn write_json(report: &RunReport, path: &Path) -> Result<(), HarnessError> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| HarnessError::Report(e.to_string()))?;
        fs::write(path, json)
            .map_err(|e| HarnessError::Report(format!("{}: {e}", path.display())))
    }
}
