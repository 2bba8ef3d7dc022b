//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::fmt::Write;
use std::sync::Arc;

use super::collector::MetricsCollector;

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "stemsplit")
    }

    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        let mut admissions: Vec<_> = snapshot.admissions.iter().collect();
        admissions.sort();
        self.write_labeled(
            &mut output,
            "admission_total",
            "Submissions by admission outcome",
            "counter",
            "outcome",
            admissions.into_iter().map(|(k, v)| (k.as_str(), *v as f64)),
        );

        self.write_single(
            &mut output,
            "dedup_joins_total",
            "Submissions that joined an existing job",
            "counter",
            snapshot.dedup_joins as f64,
        );

        self.write_single(
            &mut output,
            "queue_depth",
            "Entries in the work queue, leased or not",
            "gauge",
            snapshot.queue_depth as f64,
        );

        let mut jobs: Vec<_> = snapshot.jobs_by_status.iter().collect();
        jobs.sort();
        self.write_labeled(
            &mut output,
            "jobs",
            "Stored jobs by status",
            "gauge",
            "status",
            jobs.into_iter().map(|(k, v)| (k.as_str(), *v as f64)),
        );

        let mut failures: Vec<_> = snapshot.job_failures.iter().collect();
        failures.sort();
        self.write_labeled(
            &mut output,
            "job_failures_total",
            "Worker failures by classification",
            "counter",
            "class",
            failures.into_iter().map(|(k, v)| (k.as_str(), *v as f64)),
        );

        self.write_single(
            &mut output,
            "job_retries_total",
            "Transient failures that were requeued",
            "counter",
            snapshot.job_retries as f64,
        );

        self.write_single(
            &mut output,
            "jobs_completed_total",
            "Jobs that reached completed",
            "counter",
            snapshot.jobs_completed as f64,
        );

        let name = self.full_name("job_duration_seconds");
        let _ = writeln!(output, "# HELP {name} Time from submission to completion");
        let _ = writeln!(output, "# TYPE {name} summary");
        let _ = writeln!(output, "{name}_sum {}", snapshot.job_duration_seconds_sum);
        let _ = writeln!(output, "{name}_count {}", snapshot.job_duration_count);

        self.write_single(
            &mut output,
            "http_requests_total",
            "HTTP requests served",
            "counter",
            snapshot.http_requests as f64,
        );

        self.write_single(
            &mut output,
            "uptime_seconds",
            "Seconds since the service started",
            "gauge",
            snapshot.uptime_secs as f64,
        );

        output
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}_{}", self.namespace, name)
    }

    fn write_single(&self, output: &mut String, name: &str, help: &str, kind: &str, value: f64) {
        let full_name = self.full_name(name);
        let _ = writeln!(output, "# HELP {full_name} {help}");
        let _ = writeln!(output, "# TYPE {full_name} {kind}");
        let _ = writeln!(output, "{full_name} {value}");
    }

    fn write_labeled<'a>(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        kind: &str,
        label: &str,
        samples: impl IntoIterator<Item = (&'a str, f64)>,
    ) {
        let full_name = self.full_name(name);
        let _ = writeln!(output, "# HELP {full_name} {help}");
        let _ = writeln!(output, "# TYPE {full_name} {kind}");
        for (label_value, value) in samples {
            let _ = writeln!(
                output,
                "{full_name}{{{label}=\"{}\"}} {value}",
                escape_label(label_value)
            );
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
