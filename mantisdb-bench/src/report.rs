//! Measurement, scoring, and the letter-grade/recommendation report
//! (§4.5 "Measurement", "Scoring", "Recommendation rules").

use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mantisdb_store::MultiModelStore;

use crate::workload::{KeyGenerator, Operation, ValueBuffer, WorkloadSpec};

#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub p999_ms: f64,
}

fn percentile(sorted_nanos: &[u64], fraction: f64) -> f64 {
    if sorted_nanos.is_empty() {
        return 0.0;
    }
    let idx = ((sorted_nanos.len() as f64 - 1.0) * fraction).round() as usize;
    sorted_nanos[idx.min(sorted_nanos.len() - 1)] as f64 / 1_000_000.0
}

fn compute_latency_stats(mut latencies_nanos: Vec<u64>) -> LatencyStats {
    latencies_nanos.sort_unstable();
    if latencies_nanos.is_empty() {
        return LatencyStats { mean_ms: 0.0, min_ms: 0.0, max_ms: 0.0, p50_ms: 0.0, p95_ms: 0.0, p99_ms: 0.0, p999_ms: 0.0 };
    }
    let sum: u128 = latencies_nanos.iter().map(|&n| n as u128).sum();
    let mean_ms = (sum as f64 / latencies_nanos.len() as f64) / 1_000_000.0;
    LatencyStats {
        mean_ms,
        min_ms: latencies_nanos[0] as f64 / 1_000_000.0,
        max_ms: *latencies_nanos.last().unwrap() as f64 / 1_000_000.0,
        p50_ms: percentile(&latencies_nanos, 0.50),
        p95_ms: percentile(&latencies_nanos, 0.95),
        p99_ms: percentile(&latencies_nanos, 0.99),
        p999_ms: percentile(&latencies_nanos, 0.999),
    }
}

/// Best-effort resident memory sample (§4.5 "memory bytes resident at
/// end (sampled)"); 0 on platforms without `/proc/self/statm`.
fn sample_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|contents| contents.split_whitespace().nth(1).map(str::to_string))
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct BenchResult {
    pub name: String,
    pub operations: usize,
    pub concurrency: usize,
    pub wall_duration: Duration,
    pub ops_per_sec: f64,
    pub error_count: u64,
    pub error_rate_percent: f64,
    pub memory_bytes: u64,
    pub latency: LatencyStats,
}

/// Executes `spec` against `store`, recording every operation's latency
/// into a pre-sized slot array indexed by an atomic fetch-add counter
/// (§4.5 "Measurement").
pub async fn run_workload(store: Arc<MultiModelStore>, spec: WorkloadSpec) -> BenchResult {
    let latencies: Arc<Vec<AtomicU64>> = Arc::new((0..spec.operations).map(|_| AtomicU64::new(0)).collect());
    let next_slot = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    let per_worker_ops = spec.per_worker_operations();
    let tick = spec.per_worker_tick();

    let start = Instant::now();
    let mut handles = Vec::with_capacity(spec.concurrency);
    for worker_id in 0..spec.concurrency {
        let store = Arc::clone(&store);
        let latencies = Arc::clone(&latencies);
        let next_slot = Arc::clone(&next_slot);
        let errors = Arc::clone(&errors);
        let spec = spec.clone();

        handles.push(tokio::spawn(async move {
            run_worker(worker_id as u32, per_worker_ops, spec, store, latencies, next_slot, errors, tick).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    let wall_duration = start.elapsed();

    let recorded = next_slot.load(Ordering::Relaxed).min(latencies.len());
    let latency_samples: Vec<u64> = latencies[..recorded].iter().map(|l| l.load(Ordering::Relaxed)).collect();
    let error_count = errors.load(Ordering::Relaxed);
    let completed = recorded as u64;
    let error_rate_percent = if completed + error_count == 0 {
        0.0
    } else {
        error_count as f64 / (completed + error_count) as f64 * 100.0
    };

    BenchResult {
        name: spec.name.clone(),
        operations: spec.operations,
        concurrency: spec.concurrency,
        wall_duration,
        ops_per_sec: completed as f64 / wall_duration.as_secs_f64().max(f64::MIN_POSITIVE),
        error_count,
        error_rate_percent,
        memory_bytes: sample_memory_bytes(),
        latency: compute_latency_stats(latency_samples),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: u32,
    op_count: usize,
    spec: WorkloadSpec,
    store: Arc<MultiModelStore>,
    latencies: Arc<Vec<AtomicU64>>,
    next_slot: Arc<AtomicUsize>,
    errors: Arc<AtomicU64>,
    tick: Option<Duration>,
) {
    let mut rng = rand::thread_rng();
    let mut keys = KeyGenerator::new(spec.key_distribution, spec.keyspace);
    let values = ValueBuffer::new(spec.value_size);
    let mut ticker = tick.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    for op_id in 0..op_count {
        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }

        let key_id = keys.next_key(&mut rng);
        let key = format!("bench:{key_id}");
        let op = match spec.operation {
            Operation::Mixed if op_id % 2 == 0 => Operation::Put,
            Operation::Mixed => Operation::Get,
            other => other,
        };

        let begin = Instant::now();
        let result = match op {
            Operation::Put => {
                let value = values.stamp(worker_id, op_id as u64);
                store.set(&key, value, None).map(|_| ())
            }
            Operation::Get => store.get(&key).map(|_| ()),
            Operation::Delete => store.delete(&key).map(|_| ()),
            Operation::Mixed => unreachable!("resolved above"),
        };
        let elapsed_nanos = begin.elapsed().as_nanos() as u64;

        let slot = next_slot.fetch_add(1, Ordering::Relaxed);
        if let Some(cell) = latencies.get(slot) {
            cell.store(elapsed_nanos, Ordering::Relaxed);
        }
        if result.is_err() {
            errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Grade {
    APlus,
    A,
    AMinus,
    BPlus,
    B,
    BMinus,
    CPlus,
    C,
    CMinus,
    D,
    F,
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::AMinus => "A-",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::BMinus => "B-",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::CMinus => "C-",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

/// The deterministic §4.5 scoring formula, applied to one [`BenchResult`].
#[derive(Debug, Clone)]
pub struct Scorecard {
    pub name: String,
    pub ops_score: f64,
    pub latency_score: f64,
    pub error_score: f64,
    pub consistency_score: f64,
    pub score: f64,
    pub grade: Grade,
}

pub fn score(result: &BenchResult) -> Scorecard {
    let ops_score = (result.ops_per_sec / 1000.0 * 40.0).min(40.0).max(0.0);
    let latency_score = (30.0 - result.latency.mean_ms / 10.0).max(0.0);
    let error_score = (20.0 - result.error_rate_percent * 2.0).max(0.0);
    let consistency_score = (10.0 - result.latency.p99_ms / result.latency.p50_ms.max(0.001)).max(0.0);
    let total = ops_score + latency_score + error_score + consistency_score;

    Scorecard {
        name: result.name.clone(),
        ops_score,
        latency_score,
        error_score,
        consistency_score,
        score: total,
        grade: grade_for(total),
    }
}

fn grade_for(score: f64) -> Grade {
    if score >= 90.0 {
        Grade::APlus
    } else if score >= 85.0 {
        Grade::A
    } else if score >= 80.0 {
        Grade::AMinus
    } else if score >= 75.0 {
        Grade::BPlus
    } else if score >= 70.0 {
        Grade::B
    } else if score >= 65.0 {
        Grade::BMinus
    } else if score >= 60.0 {
        Grade::CPlus
    } else if score >= 55.0 {
        Grade::C
    } else if score >= 50.0 {
        Grade::CMinus
    } else if score >= 40.0 {
        Grade::D
    } else {
        Grade::F
    }
}

/// Derived from test name substrings (§4.5 "Recommendation rules"),
/// checked in the fixed order the spec lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Sequential,
    Random,
    Concurrency,
    Throughput,
    Memory,
    General,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Sequential => "Sequential",
            Category::Random => "Random",
            Category::Concurrency => "Concurrency",
            Category::Throughput => "Throughput",
            Category::Memory => "Memory",
            Category::General => "General",
        };
        f.write_str(s)
    }
}

pub fn categorize(name: &str) -> Category {
    if name.contains("Sequential") {
        Category::Sequential
    } else if name.contains("Random") {
        Category::Random
    } else if name.contains("Concurrent") {
        Category::Concurrency
    } else if name.contains("Throughput") {
        Category::Throughput
    } else if name.contains("Memory") {
        Category::Memory
    } else {
        Category::General
    }
}

fn recommendation_for(category: Category) -> &'static str {
    match category {
        Category::Sequential => "Sequential access score low: check key-range locality and prefetch behavior.",
        Category::Random => "Random access score low: check cache hit rate and index locality.",
        Category::Concurrency => "Concurrency score low: check lock contention and per-shard serialization points.",
        Category::Throughput => "Throughput score low: check batch sizes and I/O buffering.",
        Category::Memory => "Memory score low: check allocation churn and cache eviction pressure.",
        Category::General => "General score low: investigate workload-specific bottlenecks.",
    }
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub overall_score: f64,
    pub category_scores: Vec<(Category, f64)>,
    pub recommendations: Vec<String>,
}

/// Aggregates per-test [`Scorecard`]s into an overall score, per-category
/// means, and the recommendation list (§4.5).
pub fn summarize(scorecards: &[Scorecard]) -> Summary {
    let overall_score = if scorecards.is_empty() {
        0.0
    } else {
        scorecards.iter().map(|s| s.score).sum::<f64>() / scorecards.len() as f64
    };

    let mut categories: Vec<Category> = scorecards.iter().map(|s| categorize(&s.name)).collect();
    categories.sort();
    categories.dedup();

    let category_scores: Vec<(Category, f64)> = categories
        .into_iter()
        .map(|category| {
            let matching: Vec<f64> = scorecards.iter().filter(|s| categorize(&s.name) == category).map(|s| s.score).collect();
            let mean = matching.iter().sum::<f64>() / matching.len() as f64;
            (category, mean)
        })
        .collect();

    let mut recommendations: Vec<String> =
        category_scores.iter().filter(|(_, score)| *score < 60.0).map(|(category, _)| recommendation_for(*category).to_string()).collect();

    if recommendations.is_empty() && !category_scores.is_empty() {
        recommendations.push("All benchmarked categories meet the performance bar; no action needed.".to_string());
    }

    Summary { overall_score, category_scores, recommendations }
}

#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    fn fixed_result(ops_per_sec: f64) -> BenchResult {
        BenchResult {
            name: "Fixed".to_string(),
            operations: 1000,
            concurrency: 4,
            wall_duration: Duration::from_secs(1),
            ops_per_sec,
            error_count: 0,
            error_rate_percent: 0.0,
            memory_bytes: 0,
            latency: LatencyStats {
                mean_ms: 5.0,
                min_ms: 1.0,
                max_ms: 20.0,
                p50_ms: 4.0,
                p95_ms: 9.0,
                p99_ms: 12.0,
                p999_ms: 18.0,
            },
        }
    }

    proptest! {
        /// P10: increasing ops/sec while holding every other measurement
        /// fixed never decreases `score()` (ops_score is monotone in
        /// ops_per_sec and the other three terms don't depend on it).
        #[test]
        fn p10_score_is_monotone_in_ops_per_sec(
            low in 0.0f64..5000.0,
            delta in 0.0f64..5000.0,
        ) {
            let high = low + delta;
            let low_score = score(&fixed_result(low)).score;
            let high_score = score(&fixed_result(high)).score;
            prop_assert!(high_score >= low_score - 1e-9);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::KeyDistribution;

    fn store() -> Arc<MultiModelStore> {
        Arc::new(MultiModelStore::new(16 * 1024 * 1024, None))
    }

    fn spec(name: &str, operation: Operation, operations: usize, concurrency: usize) -> WorkloadSpec {
        WorkloadSpec {
            name: name.to_string(),
            operation,
            key_distribution: KeyDistribution::Sequential,
            value_size: 64,
            operations,
            concurrency,
            rate_limit: None,
            keyspace: 1000,
        }
    }

    #[tokio::test]
    async fn closed_loop_put_workload_records_one_latency_per_op() {
        let result = run_workload(store(), spec("PutSequential", Operation::Put, 200, 4)).await;
        assert_eq!(result.operations, 200);
        assert_eq!(result.error_count, 0);
        assert!(result.ops_per_sec > 0.0);
    }

    #[tokio::test]
    async fn get_workload_on_empty_store_counts_not_found_as_errors() {
        let result = run_workload(store(), spec("GetRandom", Operation::Get, 50, 2)).await;
        assert_eq!(result.error_count, 50);
        assert!((result.error_rate_percent - 100.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn scenario_benchmark_scoring_is_deterministic_given_measurements() {
        let result = BenchResult {
            name: "ThroughputMixed".to_string(),
            operations: 1000,
            concurrency: 8,
            wall_duration: Duration::from_secs(1),
            ops_per_sec: 2000.0,
            error_count: 0,
            error_rate_percent: 0.0,
            memory_bytes: 0,
            latency: LatencyStats { mean_ms: 5.0, min_ms: 1.0, max_ms: 20.0, p50_ms: 4.0, p95_ms: 9.0, p99_ms: 12.0, p999_ms: 18.0 },
        };
        let card = score(&result);
        assert!((card.ops_score - 40.0).abs() < 1e-9);
        assert!((card.latency_score - 29.5).abs() < 1e-9);
        assert!((card.error_score - 20.0).abs() < 1e-9);
        assert!((card.consistency_score - 7.0).abs() < 1e-9);
        assert!((card.score - 96.5).abs() < 1e-9);
        assert_eq!(card.grade, Grade::APlus);
    }

    /// Scenario 6 (§8): ops_per_sec=1000, avg_latency=1ms, error_rate=0%,
    /// p99=2ms, p50=1ms -> score = 40 + 29.9 + 20 + 8 = 97.9, grade A+.
    #[test]
    fn scenario_benchmark_scoring_matches_worked_example() {
        let result = BenchResult {
            name: "Example".to_string(),
            operations: 1000,
            concurrency: 1,
            wall_duration: Duration::from_secs(1),
            ops_per_sec: 1000.0,
            error_count: 0,
            error_rate_percent: 0.0,
            memory_bytes: 0,
            latency: LatencyStats { mean_ms: 1.0, min_ms: 0.5, max_ms: 3.0, p50_ms: 1.0, p95_ms: 1.8, p99_ms: 2.0, p999_ms: 2.9 },
        };
        let card = score(&result);
        assert!((card.score - 97.9).abs() < 1e-9, "got {}", card.score);
        assert_eq!(card.grade, Grade::APlus);
    }

    #[test]
    fn category_below_threshold_gets_its_recommendation() {
        let low = Scorecard {
            name: "ConcurrentWriters".to_string(),
            ops_score: 5.0,
            latency_score: 5.0,
            error_score: 5.0,
            consistency_score: 0.0,
            score: 15.0,
            grade: Grade::F,
        };
        let summary = summarize(&[low]);
        assert_eq!(summary.recommendations.len(), 1);
        assert!(summary.recommendations[0].contains("lock contention"));
    }

    #[test]
    fn all_categories_passing_yields_positive_recommendation() {
        let good = Scorecard {
            name: "SequentialReads".to_string(),
            ops_score: 40.0,
            latency_score: 30.0,
            error_score: 20.0,
            consistency_score: 10.0,
            score: 100.0,
            grade: Grade::APlus,
        };
        let summary = summarize(&[good]);
        assert_eq!(summary.recommendations.len(), 1);
        assert!(summary.recommendations[0].contains("no action needed"));
    }
}
