//! Workload generation (§4.5 "Workload generation"): reproducible key
//! distributions and pre-allocated value buffers so per-op RNG and
//! allocation cost never dominate the measured latency.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Get,
    Put,
    Delete,
    /// Alternates put/get 1:1, matching a read/write mixed workload.
    Mixed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum KeyDistribution {
    Sequential,
    Random,
    Zipf { exponent: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub operation: Operation,
    pub key_distribution: KeyDistribution,
    pub value_size: usize,
    pub operations: usize,
    pub concurrency: usize,
    /// Total operations/sec across all workers; `None` runs closed-loop.
    pub rate_limit: Option<f64>,
    /// Size of the key space keys are drawn from (sequential wraps, random
    /// and zipf sample uniformly/skewed over `0..keyspace`).
    pub keyspace: usize,
}

impl WorkloadSpec {
    pub fn per_worker_operations(&self) -> usize {
        self.operations / self.concurrency.max(1)
    }

    /// `None` if unbounded; otherwise the per-worker tick period implied by
    /// splitting `rate_limit` evenly across `concurrency` workers (§4.5
    /// "each worker emits operations at rate_limit / concurrency per
    /// second").
    pub fn per_worker_tick(&self) -> Option<std::time::Duration> {
        self.rate_limit.map(|total| {
            let per_worker = total / self.concurrency.max(1) as f64;
            std::time::Duration::from_secs_f64(1.0 / per_worker.max(f64::MIN_POSITIVE))
        })
    }
}

/// Precomputed cumulative weights for sampling a Zipf-skewed key within
/// `0..n` via inverse-CDF binary search. Built once per worker, not per op.
pub struct ZipfSampler {
    cumulative: Vec<f64>,
}

impl ZipfSampler {
    pub fn new(n: usize, exponent: f64) -> Self {
        let n = n.max(1);
        let mut cumulative = Vec::with_capacity(n);
        let mut total = 0.0;
        for rank in 1..=n {
            total += 1.0 / (rank as f64).powf(exponent);
            cumulative.push(total);
        }
        for weight in &mut cumulative {
            *weight /= total;
        }
        ZipfSampler { cumulative }
    }

    pub fn sample(&self, rng: &mut impl Rng) -> usize {
        let draw: f64 = rng.gen();
        match self.cumulative.binary_search_by(|w| w.partial_cmp(&draw).unwrap()) {
            Ok(idx) | Err(idx) => idx.min(self.cumulative.len() - 1),
        }
    }
}

/// Per-worker key generator. Sequential advances a local counter (wrapping
/// at `keyspace`); random and zipf draw from the worker's own RNG, so
/// workers never contend on a shared generator.
pub enum KeyGenerator {
    Sequential { next: usize, keyspace: usize },
    Random { keyspace: usize },
    Zipf { sampler: ZipfSampler },
}

impl KeyGenerator {
    pub fn new(distribution: KeyDistribution, keyspace: usize) -> Self {
        match distribution {
            KeyDistribution::Sequential => KeyGenerator::Sequential { next: 0, keyspace: keyspace.max(1) },
            KeyDistribution::Random => KeyGenerator::Random { keyspace: keyspace.max(1) },
            KeyDistribution::Zipf { exponent } => KeyGenerator::Zipf { sampler: ZipfSampler::new(keyspace, exponent) },
        }
    }

    pub fn next_key(&mut self, rng: &mut impl Rng) -> usize {
        match self {
            KeyGenerator::Sequential { next, keyspace } => {
                let key = *next;
                *next = (*next + 1) % *keyspace;
                key
            }
            KeyGenerator::Random { keyspace } => rng.gen_range(0..*keyspace),
            KeyGenerator::Zipf { sampler } => sampler.sample(rng),
        }
    }
}

/// A reusable per-worker value buffer. Each op stamps 16 bytes of identity
/// (worker id, op id, magic) into a fresh copy, avoiding per-op allocation
/// or RNG cost on the measured path (§4.5 "Value generation").
pub struct ValueBuffer {
    template: Vec<u8>,
}

const MAGIC: u32 = 0x4d_44_42_30; // "MDB0"

impl ValueBuffer {
    pub fn new(size: usize) -> Self {
        ValueBuffer { template: vec![0xAB; size.max(16)] }
    }

    pub fn stamp(&self, worker_id: u32, op_id: u64) -> Vec<u8> {
        let mut buf = self.template.clone();
        buf[0..4].copy_from_slice(&worker_id.to_le_bytes());
        buf[4..12].copy_from_slice(&op_id.to_le_bytes());
        buf[12..16].copy_from_slice(&MAGIC.to_le_bytes());
        buf
    }

    pub fn verify(data: &[u8]) -> Option<(u32, u64)> {
        if data.len() < 16 {
            return None;
        }
        let magic = u32::from_le_bytes(data[12..16].try_into().unwrap());
        if magic != MAGIC {
            return None;
        }
        let worker_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let op_id = u64::from_le_bytes(data[4..12].try_into().unwrap());
        Some((worker_id, op_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_wraps_at_keyspace() {
        let mut rng = rand::thread_rng();
        let mut gen = KeyGenerator::new(KeyDistribution::Sequential, 3);
        let keys: Vec<usize> = (0..7).map(|_| gen.next_key(&mut rng)).collect();
        assert_eq!(keys, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn zipf_sampler_favors_low_ranks() {
        let sampler = ZipfSampler::new(100, 1.2);
        let mut rng = rand::thread_rng();
        let mut counts = vec![0usize; 100];
        for _ in 0..5000 {
            counts[sampler.sample(&mut rng)] += 1;
        }
        let low_half: usize = counts[..10].iter().sum();
        let high_half: usize = counts[90..].iter().sum();
        assert!(low_half > high_half, "zipf distribution should favor low ranks");
    }

    #[test]
    fn value_buffer_round_trips_identity() {
        let buf = ValueBuffer::new(64);
        let stamped = buf.stamp(7, 42);
        assert_eq!(ValueBuffer::verify(&stamped), Some((7, 42)));
    }

    #[test]
    fn value_buffer_rejects_foreign_data() {
        assert_eq!(ValueBuffer::verify(&[0u8; 64]), None);
    }
}
