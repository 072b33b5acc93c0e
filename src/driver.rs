//! C8: the driver — spawns workers, sequences warm-up/measure/cool-down,
//! and assembles the final report, grounded on
//! `examples/original_source/apib/apib_main.c`'s `main` / `RunTest`.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::RunConfig;
use crate::error::ApibError;
use crate::monitor;
use crate::rlimit;
use crate::stats::{Aggregate, Counters, CountersSlot};
use crate::worker::{Command, Worker};

const STOP_TIMEOUT_SECS: u64 = 2;
const INTERVAL: Duration = Duration::from_secs(5);

pub struct Report {
    pub name: String,
    pub throughput: f64,
    pub aggregate: Aggregate,
    pub threads: usize,
    pub connections: usize,
    pub client_cpu_pct: Option<f64>,
    pub server_cpu_pct: Option<f64>,
    pub server2_cpu_pct: Option<f64>,
    pub client_mem_pct: Option<f64>,
    pub server_mem_pct: Option<f64>,
    pub server2_mem_pct: Option<f64>,
}

struct RunningWorker {
    handle: JoinHandle<()>,
    sender: mpsc::Sender<Command>,
    counters: Arc<CountersSlot>,
}

pub struct Driver {
    config: RunConfig,
}

impl Driver {
    pub fn new(config: RunConfig) -> Driver {
        Driver { config }
    }

    pub fn run(&self) -> Result<Report, ApibError> {
        rlimit::raise_if_needed(self.config.concurrency)?;

        let mut monitor1 = self.config.monitor.as_deref().map(monitor::Client::connect).transpose_ok();
        let mut monitor2 = self.config.monitor2.as_deref().map(monitor::Client::connect).transpose_ok();

        let workers = self.spawn_workers()?;

        if !self.config.warmup.is_zero() {
            tracing::info!(warmup_secs = self.config.warmup.as_secs(), "warming up");
            std::thread::sleep(self.config.warmup);
            // Discard warm-up stats by swapping and dropping them.
            for w in &workers {
                let _ = w.counters.swap();
            }
        }

        if let Some(m) = monitor1.as_mut() {
            m.reset();
        }
        if let Some(m) = monitor2.as_mut() {
            m.reset();
        }

        let measure_start = Instant::now();
        let mut elapsed = Duration::ZERO;
        let mut cpu1_samples = Vec::new();
        let mut cpu2_samples = Vec::new();

        let mut total_successful = 0u64;
        let mut total_failed = 0u64;
        let mut total_bytes_read = 0u64;
        let mut total_bytes_written = 0u64;
        let mut total_connections_opened = 0u64;
        let mut total_latencies = Vec::new();

        let mut fold_in = |counters: Vec<Box<Counters>>| {
            for c in counters {
                total_successful += c.successful_requests;
                total_failed += c.failed_requests;
                total_bytes_read += c.bytes_read;
                total_bytes_written += c.bytes_written;
                total_connections_opened += c.connections_opened;
                total_latencies.extend(c.latencies);
            }
        };

        while elapsed < self.config.duration {
            let tick = INTERVAL.min(self.config.duration - elapsed);
            std::thread::sleep(tick);
            elapsed = measure_start.elapsed();

            let counters: Vec<Box<Counters>> = workers.iter().map(|w| w.counters.swap()).collect();
            let interval_successful: u64 = counters.iter().map(|c| c.successful_requests).sum();
            let interval_throughput = interval_successful as f64 / tick.as_secs_f64();
            tracing::info!(completed = interval_successful, throughput = interval_throughput, "interval");
            fold_in(counters);

            if let Some(m) = monitor1.as_mut() {
                if let Some(cpu) = m.cpu() {
                    cpu1_samples.push(cpu);
                }
            }
            if let Some(m) = monitor2.as_mut() {
                if let Some(cpu) = m.cpu() {
                    cpu2_samples.push(cpu);
                }
            }
        }

        for w in &workers {
            let _ = w.sender.send(Command::Stop { timeout_secs: STOP_TIMEOUT_SECS });
        }
        for w in workers {
            if w.handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
            // Safe to swap now: the worker thread has exited, so there is no
            // concurrent writer left on this slot.
            fold_in(vec![w.counters.swap()]);
        }

        let total_elapsed = measure_start.elapsed().as_secs_f64();
        let final_agg = Aggregate::from_totals(
            total_successful,
            total_failed,
            total_bytes_read,
            total_bytes_written,
            total_connections_opened,
            total_elapsed,
            total_latencies,
        );

        let avg = |v: &[f64]| -> Option<f64> {
            if v.is_empty() {
                None
            } else {
                Some(v.iter().sum::<f64>() / v.len() as f64)
            }
        };

        Ok(Report {
            name: self.config.run_name.clone(),
            throughput: final_agg.interval_throughput(),
            aggregate: final_agg,
            threads: self.config.io_threads,
            connections: self.config.concurrency,
            client_cpu_pct: None,
            server_cpu_pct: avg(&cpu1_samples),
            server2_cpu_pct: avg(&cpu2_samples),
            client_mem_pct: None,
            server_mem_pct: monitor1.as_mut().and_then(|m| m.mem()),
            server2_mem_pct: monitor2.as_mut().and_then(|m| m.mem()),
        })
    }

    fn spawn_workers(&self) -> Result<Vec<RunningWorker>, ApibError> {
        #[cfg(feature = "tls")]
        let tls_context = self.build_tls_context()?;

        let mut workers = Vec::with_capacity(self.config.io_threads);
        for i in 0..self.config.io_threads {
            #[cfg(feature = "tls")]
            let worker_cfg = self.config.worker_config(i, tls_context.clone());
            #[cfg(not(feature = "tls"))]
            let worker_cfg = self.config.worker_config(i);

            let counters = Arc::new(CountersSlot::new());
            let (tx, rx) = mpsc::channel();
            let counters_for_thread = counters.clone();
            let handle = std::thread::Builder::new()
                .name(format!("apib-worker-{i}"))
                .spawn(move || {
                    match Worker::new(i, worker_cfg, counters_for_thread, rx) {
                        Ok(w) => w.run(),
                        Err(e) => tracing::error!(worker = i, error = %e, "failed to create reactor backend"),
                    }
                })
                .map_err(|e| ApibError::Fatal(format!("spawning worker thread: {e}")))?;
            workers.push(RunningWorker { handle, sender: tx, counters });
        }
        Ok(workers)
    }

    #[cfg(feature = "tls")]
    fn build_tls_context(&self) -> Result<Option<crate::socket::TlsContext>, ApibError> {
        Ok(Some(crate::socket::TlsContext::new(
            self.config.tls_verify,
            self.config.tls_ca_bundle.as_deref(),
        )?))
    }
}

trait TransposeOk<T> {
    fn transpose_ok(self) -> Option<T>;
}

impl<T> TransposeOk<T> for Option<Result<T, ApibError>> {
    fn transpose_ok(self) -> Option<T> {
        match self {
            Some(Ok(v)) => Some(v),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "monitor connection unavailable, continuing without it");
                None
            }
            None => None,
        }
    }
}
