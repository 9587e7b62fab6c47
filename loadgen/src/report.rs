//! Aggregation of request results into run reports, and their rendering.

use std::fmt;
use std::time::Duration;

use bytesize::ByteSize;
use serde::Serialize;
use sketches_ddsketch::DDSketch;
use yansi::Paint;

use crate::error::{Error, Result};
use crate::executor::{Outcome, RequestResult};
use crate::request::Method;

/// Latency distribution of the successful requests of a run, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Percentiles {
    /// Fastest request.
    pub min_ms: f64,
    /// Median.
    pub p50_ms: f64,
    /// 90th percentile.
    pub p90_ms: f64,
    /// 99th percentile.
    pub p99_ms: f64,
    /// Slowest request.
    pub max_ms: f64,
}

/// Summary statistics of a completed run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    /// Name of the run.
    pub label: String,
    /// The method all requests of the run used.
    pub method: Method,
    /// Number of requests the run was asked to perform.
    pub total_requests: u64,
    /// Requests that succeeded and passed verification.
    pub succeeded: u64,
    /// Requests that failed on the network or with an unexpected status.
    pub transport_failed: u64,
    /// Requests whose response did not match the payload.
    pub integrity_failed: u64,
    /// Requests never released because the run was cancelled.
    pub not_started: u64,
    /// Number of waves the gate released.
    pub waves: u64,
    /// Sum of the elapsed times of all successful requests.
    pub total_elapsed_ms: u64,
    /// `total_elapsed_ms / succeeded`.
    pub average_ms: f64,
    /// Latency distribution of the successful requests.
    pub percentiles: Percentiles,
    /// Payload bytes moved by successful requests.
    pub bytes_transferred: u64,
    /// Wall-clock duration of the whole run.
    #[serde(serialize_with = "humantime_serde::serialize")]
    pub wall_time: Duration,
}

impl RunReport {
    /// Completed requests per second of wall-clock time.
    pub fn ops_per_second(&self) -> f64 {
        per_second(self.succeeded as f64, self.wall_time)
    }

    /// Transferred payload bytes per second of wall-clock time.
    pub fn bytes_per_second(&self) -> u64 {
        per_second(self.bytes_transferred as f64, self.wall_time) as u64
    }

    /// Every request the run was asked for is accounted for exactly once.
    pub fn is_complete(&self) -> bool {
        self.succeeded + self.transport_failed + self.integrity_failed + self.not_started
            == self.total_requests
    }
}

impl fmt::Debug for ReportAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportAggregator")
            .field("label", &self.label)
            .field("method", &self.method)
            .field("total_requests", &self.total_requests)
            .field("succeeded", &self.succeeded)
            .field("transport_failed", &self.transport_failed)
            .field("integrity_failed", &self.integrity_failed)
            .field("not_started", &self.not_started)
            .field("waves", &self.waves)
            .field("total_elapsed_ms", &self.total_elapsed_ms)
            .field("bytes_transferred", &self.bytes_transferred)
            .field("samples", &self.timing.count())
            .field("wall_time", &self.wall_time)
            .finish()
    }
}

fn per_second(value: f64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 { value / secs } else { 0.0 }
}

/// Accumulates the results of one run.
///
/// A single flow owns the aggregator and feeds it results as they arrive, so no locking is
/// involved.
pub struct ReportAggregator {
    label: String,
    method: Method,
    total_requests: u64,

    succeeded: u64,
    transport_failed: u64,
    integrity_failed: u64,
    not_started: u64,
    waves: u64,

    total_elapsed_ms: u64,
    bytes_transferred: u64,
    timing: DDSketch,
    wall_time: Duration,
}

impl ReportAggregator {
    /// Creates an empty aggregator for a run of `total_requests` requests.
    pub fn new(label: impl Into<String>, method: Method, total_requests: u64) -> Self {
        Self {
            label: label.into(),
            method,
            total_requests,
            succeeded: 0,
            transport_failed: 0,
            integrity_failed: 0,
            not_started: 0,
            waves: 0,
            total_elapsed_ms: 0,
            bytes_transferred: 0,
            timing: DDSketch::default(),
            wall_time: Duration::ZERO,
        }
    }

    /// Records one result.
    ///
    /// Only successes contribute to timing. A failed request's latency says nothing about the
    /// server's regular performance.
    pub fn record(&mut self, result: RequestResult) {
        match result.outcome {
            Outcome::Success => {
                self.succeeded += 1;
                self.total_elapsed_ms += result.elapsed_ms;
                self.bytes_transferred += result.bytes;
                self.timing.add(result.elapsed_ms as f64);
            }
            Outcome::TransportFailure { .. } => self.transport_failed += 1,
            Outcome::IntegrityMismatch { .. } => self.integrity_failed += 1,
        }
    }

    /// Records requests that were never released.
    pub fn record_not_started(&mut self, count: u64) {
        self.not_started += count;
    }

    /// Records the number of waves and the wall-clock time of the run.
    pub fn finish(&mut self, waves: u64, wall_time: Duration) {
        self.waves = waves;
        self.wall_time = wall_time;
    }

    /// Number of results recorded so far, across all outcomes.
    pub fn recorded(&self) -> u64 {
        self.succeeded + self.transport_failed + self.integrity_failed
    }

    /// Computes the report.
    ///
    /// Fails with [`Error::NoSamples`] if no request succeeded, as there is no average to report.
    pub fn summary(&self) -> Result<RunReport> {
        if self.succeeded == 0 {
            return Err(Error::NoSamples {
                transport_failed: self.transport_failed,
                integrity_failed: self.integrity_failed,
                not_started: self.not_started,
            });
        }

        Ok(RunReport {
            label: self.label.clone(),
            method: self.method,
            total_requests: self.total_requests,
            succeeded: self.succeeded,
            transport_failed: self.transport_failed,
            integrity_failed: self.integrity_failed,
            not_started: self.not_started,
            waves: self.waves,
            total_elapsed_ms: self.total_elapsed_ms,
            average_ms: self.total_elapsed_ms as f64 / self.succeeded as f64,
            percentiles: self.percentiles(),
            bytes_transferred: self.bytes_transferred,
            wall_time: self.wall_time,
        })
    }

    fn percentiles(&self) -> Percentiles {
        let quantile = |q: f64| self.timing.quantile(q).ok().flatten().unwrap_or_default();
        Percentiles {
            min_ms: self.timing.min().unwrap_or_default(),
            p50_ms: quantile(0.5),
            p90_ms: quantile(0.9),
            p99_ms: quantile(0.99),
            max_ms: self.timing.max().unwrap_or_default(),
        }
    }
}

/// Prints a run report to stdout.
pub fn print_report(report: &RunReport) {
    println!();
    println!(
        "{} {} ({}, {} requests, {} waves)",
        "## Run".bold(),
        report.label.as_str().bold().blue(),
        report.method,
        report.total_requests.bold(),
        report.waves,
    );

    print!("{} ({} ops", "OK:".bold().green(), report.succeeded.bold());
    print_failures(
        report.transport_failed,
        report.integrity_failed,
        report.not_started,
    );
    println!(")");

    print_elapsed(report.total_elapsed_ms, report.average_ms);
    print_ops(report.ops_per_second());
    print_throughput(report.bytes_per_second());
    print_percentiles(&report.percentiles);
}

/// Prints the combined counts of several runs.
///
/// Latency distributions cannot be merged from the reports, so only counts, the overall average
/// and the throughput over the summed wall time are shown.
pub fn print_totals(reports: &[RunReport]) {
    let sum = |field: fn(&RunReport) -> u64| reports.iter().map(field).sum::<u64>();

    let succeeded = sum(|r| r.succeeded);
    let total_elapsed_ms = sum(|r| r.total_elapsed_ms);
    let bytes_transferred = sum(|r| r.bytes_transferred);
    let wall_time: Duration = reports.iter().map(|r| r.wall_time).sum();

    println!();
    println!("{}", "## TOTALS".bold());
    print!("{} ({} ops", "OK:".bold().green(), succeeded.bold());
    print_failures(
        sum(|r| r.transport_failed),
        sum(|r| r.integrity_failed),
        sum(|r| r.not_started),
    );
    println!(")");

    let average_ms = if succeeded > 0 {
        total_elapsed_ms as f64 / succeeded as f64
    } else {
        0.0
    };
    print_elapsed(total_elapsed_ms, average_ms);
    print_ops(per_second(succeeded as f64, wall_time));
    print_throughput(per_second(bytes_transferred as f64, wall_time) as u64);
}

fn print_failures(transport_failed: u64, integrity_failed: u64, not_started: u64) {
    if transport_failed > 0 {
        print!(
            ", {}",
            format!("{transport_failed} TRANSPORT FAILURES").bold().red()
        );
    }
    if integrity_failed > 0 {
        print!(
            ", {}",
            format!("{integrity_failed} INTEGRITY FAILURES").bold().red()
        );
    }
    if not_started > 0 {
        print!(", {}", format!("{not_started} NOT STARTED").bold().yellow());
    }
}

fn print_elapsed(total_elapsed_ms: u64, average_ms: f64) {
    println!(
        "  total: {} ms; avg: {:.2} ms",
        total_elapsed_ms.bold(),
        average_ms.bold()
    );
}

fn print_percentiles(percentiles: &Percentiles) {
    println!(
        "  min: {:.2} ms; p50: {:.2} ms; p90: {:.2} ms; p99: {:.2} ms; max: {:.2} ms",
        percentiles.min_ms,
        percentiles.p50_ms.bold(),
        percentiles.p90_ms,
        percentiles.p99_ms,
        percentiles.max_ms,
    );
}

fn print_ops(ops_per_second: f64) {
    print!("  {:.2} operations/s", ops_per_second.bold());
}

fn print_throughput(bytes_per_second: u64) {
    println!(", {}/s", ByteSize::b(bytes_per_second).bold());
}
