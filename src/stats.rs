//! C7: statistics layer. Per-worker `Counters` reachable through an atomic
//! pointer, swapped out by the aggregator without locking the I/O hot path,
//! grounded on `examples/original_source/apib/apib_common.h`/`apib_main.c`
//! (the `IOThread` stats struct and `EndIOThread`'s percentile math).

use std::sync::atomic::{AtomicPtr, Ordering};

/// Per-worker counters. Exclusively owned by the worker until swapped out
/// via [`CountersSlot::swap`], then exclusively owned by the aggregator
/// (spec section 4.7 / section 5 memory-ownership rule).
#[derive(Debug, Default)]
pub struct Counters {
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub connections_opened: u64,
    pub latencies: Vec<u64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_response(&mut self, status_code: u16, latency_nanos: u64) {
        if (200..300).contains(&status_code) {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.latencies.push(latency_nanos);
    }

    pub fn record_failure(&mut self) {
        self.failed_requests += 1;
    }

    pub fn record_connection_opened(&mut self) {
        self.connections_opened += 1;
    }

    pub fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    pub fn add_bytes_written(&mut self, n: u64) {
        self.bytes_written += n;
    }
}

/// Worker-side handle: the single connection-callback-reachable slot holding
/// the current `Counters` behind an atomic pointer. Connection callbacks on
/// this worker are the only writers and are fully serialized (spec section
/// 4.6), so `get_mut` is safe without further synchronization; only `swap`
/// needs to be atomic, since it is the handoff point to the aggregator
/// thread.
pub struct CountersSlot {
    ptr: AtomicPtr<Counters>,
}

impl CountersSlot {
    pub fn new() -> Self {
        CountersSlot {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(Counters::new()))),
        }
    }

    /// Mutable access for the owning worker thread. Must not be called
    /// concurrently with `swap` from another thread on the same slot instance
    /// without external synchronization of *which* thread currently owns it;
    /// in this crate the worker thread is the sole caller.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
        let ptr = self.ptr.load(Ordering::Acquire);
        let counters = unsafe { &mut *ptr };
        f(counters)
    }

    /// Atomically publish a fresh empty `Counters` and return ownership of
    /// the previous one to the caller (the aggregator).
    pub fn swap(&self) -> Box<Counters> {
        let fresh = Box::into_raw(Box::new(Counters::new()));
        let old = self.ptr.swap(fresh, Ordering::AcqRel);
        unsafe { Box::from_raw(old) }
    }
}

impl Drop for CountersSlot {
    fn drop(&mut self) {
        let ptr = self.ptr.load(Ordering::Acquire);
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

impl Default for CountersSlot {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the inner Counters is accessed either exclusively by the owning
// worker thread (with_current) or exclusively by the thread that won the
// swap (the returned Box); the AtomicPtr itself provides the happens-before
// edge for the handoff.
unsafe impl Send for CountersSlot {}
unsafe impl Sync for CountersSlot {}

/// Aggregated, merged statistics across all workers for one reporting
/// interval or the final report (spec section 4.7).
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub connections_opened: u64,
    pub elapsed_seconds: f64,
    sorted_latencies_nanos: Vec<u64>,
}

impl Aggregate {
    /// Merge a batch of swapped-out worker `Counters` into one aggregate over
    /// `elapsed_seconds`, sorting the union of latency samples once.
    pub fn merge(counters: Vec<Box<Counters>>, elapsed_seconds: f64) -> Aggregate {
        let mut agg = Aggregate {
            elapsed_seconds,
            ..Default::default()
        };
        let mut latencies = Vec::new();
        for c in counters {
            agg.successful_requests += c.successful_requests;
            agg.failed_requests += c.failed_requests;
            agg.bytes_read += c.bytes_read;
            agg.bytes_written += c.bytes_written;
            agg.connections_opened += c.connections_opened;
            latencies.extend(c.latencies);
        }
        latencies.sort_unstable();
        agg.sorted_latencies_nanos = latencies;
        agg
    }

    /// Build an aggregate directly from running totals the driver has kept
    /// across every interval swap (spec section 4.7 final report: "merges
    /// all collected latency vectors, sorts the union once").
    #[allow(clippy::too_many_arguments)]
    pub fn from_totals(
        successful_requests: u64,
        failed_requests: u64,
        bytes_read: u64,
        bytes_written: u64,
        connections_opened: u64,
        elapsed_seconds: f64,
        mut latencies_nanos: Vec<u64>,
    ) -> Aggregate {
        latencies_nanos.sort_unstable();
        Aggregate {
            successful_requests,
            failed_requests,
            bytes_read,
            bytes_written,
            connections_opened,
            elapsed_seconds,
            sorted_latencies_nanos: latencies_nanos,
        }
    }

    pub fn completed_requests(&self) -> u64 {
        self.successful_requests + self.failed_requests
    }

    pub fn interval_throughput(&self) -> f64 {
        if self.elapsed_seconds <= 0.0 {
            0.0
        } else {
            self.successful_requests as f64 / self.elapsed_seconds
        }
    }

    /// `percentile(p) = sorted[(len * p) / 100]` for p < 100, `sorted[len-1]`
    /// for p = 100 (spec section 4.7, exact integer-slot formula — no
    /// interpolation). Returns 0 for an empty sample set.
    pub fn percentile_nanos(&self, p: u32) -> u64 {
        let len = self.sorted_latencies_nanos.len();
        if len == 0 {
            return 0;
        }
        if p >= 100 {
            return self.sorted_latencies_nanos[len - 1];
        }
        let ix = (len * p as usize) / 100;
        self.sorted_latencies_nanos[ix.min(len - 1)]
    }

    pub fn min_latency_nanos(&self) -> u64 {
        self.percentile_nanos(0)
    }

    pub fn max_latency_nanos(&self) -> u64 {
        self.percentile_nanos(100)
    }

    pub fn avg_latency_nanos(&self) -> f64 {
        let len = self.sorted_latencies_nanos.len();
        if len == 0 {
            return 0.0;
        }
        self.sorted_latencies_nanos.iter().sum::<u64>() as f64 / len as f64
    }

    pub fn stddev_latency_nanos(&self) -> f64 {
        let len = self.sorted_latencies_nanos.len();
        if len < 2 {
            return 0.0;
        }
        let mean = self.avg_latency_nanos();
        let variance = self
            .sorted_latencies_nanos
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / len as f64;
        variance.sqrt()
    }

    /// `8 * bytes / (1_048_576 * elapsed_seconds)` megabits per second.
    pub fn bandwidth_mbps(bytes: u64, elapsed_seconds: f64) -> f64 {
        if elapsed_seconds <= 0.0 {
            return 0.0;
        }
        (8.0 * bytes as f64) / (1_048_576.0 * elapsed_seconds)
    }

    pub fn send_bandwidth_mbps(&self) -> f64 {
        Self::bandwidth_mbps(self.bytes_written, self.elapsed_seconds)
    }

    pub fn receive_bandwidth_mbps(&self) -> f64 {
        Self::bandwidth_mbps(self.bytes_read, self.elapsed_seconds)
    }

    pub fn sample_count(&self) -> usize {
        self.sorted_latencies_nanos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters_with(latencies: &[u64], ok: u64, failed: u64) -> Box<Counters> {
        Box::new(Counters {
            successful_requests: ok,
            failed_requests: failed,
            bytes_read: 0,
            bytes_written: 0,
            connections_opened: 0,
            latencies: latencies.to_vec(),
        })
    }

    #[test]
    fn swap_hands_off_current_counters_and_publishes_fresh_one() {
        let slot = CountersSlot::new();
        slot.with_current(|c| c.record_response(200, 100));
        let old = slot.swap();
        assert_eq!(old.successful_requests, 1);
        slot.with_current(|c| assert_eq!(c.successful_requests, 0));
    }

    #[test]
    fn record_response_buckets_by_status_class() {
        let mut c = Counters::new();
        c.record_response(200, 10);
        c.record_response(404, 20);
        c.record_response(500, 30);
        assert_eq!(c.successful_requests, 1);
        assert_eq!(c.failed_requests, 2);
        assert_eq!(c.latencies, vec![10, 20, 30]);
    }

    #[test]
    fn percentile_slots_match_spec_formula() {
        let latencies: Vec<u64> = (1..=100).collect();
        let agg = Aggregate::merge(vec![counters_with(&latencies, 100, 0)], 1.0);
        assert_eq!(agg.percentile_nanos(0), 1);
        assert_eq!(agg.percentile_nanos(50), 51);
        assert_eq!(agg.percentile_nanos(100), 100);
    }

    #[test]
    fn percentile_is_monotonic() {
        let latencies = vec![5, 1, 9, 3, 7, 2, 8, 4, 6, 10];
        let agg = Aggregate::merge(vec![counters_with(&latencies, 10, 0)], 1.0);
        let mut last = 0;
        for p in 0..=100u32 {
            let v = agg.percentile_nanos(p);
            assert!(v >= last, "percentile not monotonic at p={p}");
            last = v;
        }
    }

    #[test]
    fn bandwidth_formula_matches_spec() {
        // 1_048_576 bytes over 1 second -> 8 Mb/s
        assert!((Aggregate::bandwidth_mbps(1_048_576, 1.0) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn merge_sums_across_workers_and_sorts_once() {
        let agg = Aggregate::merge(
            vec![counters_with(&[30, 10], 2, 1), counters_with(&[20], 1, 0)],
            2.0,
        );
        assert_eq!(agg.successful_requests, 3);
        assert_eq!(agg.failed_requests, 1);
        assert_eq!(agg.min_latency_nanos(), 10);
        assert_eq!(agg.max_latency_nanos(), 30);
        assert_eq!(agg.sample_count(), 3);
    }

    #[test]
    fn empty_aggregate_has_zeroed_percentiles() {
        let agg = Aggregate::merge(vec![], 1.0);
        assert_eq!(agg.percentile_nanos(50), 0);
        assert_eq!(agg.avg_latency_nanos(), 0.0);
        assert_eq!(agg.stddev_latency_nanos(), 0.0);
    }
}
