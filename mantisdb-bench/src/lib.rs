//! Reproducible workload generation, latency/throughput measurement, and
//! composite scoring over a [`MultiModelStore`] (§4.5).

pub mod report;
pub mod workload;

pub use report::{categorize, run_workload, score, summarize, BenchResult, Category, Grade, LatencyStats, Scorecard, Summary};
pub use workload::{KeyDistribution, KeyGenerator, Operation, ValueBuffer, WorkloadSpec, ZipfSampler};
