//! C6: one worker event loop per OS thread, driving N connections through a
//! readiness-based reactor, grounded on
//! `examples/original_source/apib/apib_iothread.cc`'s `IOThread` run loop.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::WorkerConfig;
use crate::connection::Connection;
use crate::reactor::Backend;
use crate::stats::CountersSlot;

/// Control-plane message a driver may post to a worker (spec section 3).
#[derive(Debug, Clone)]
pub enum Command {
    Stop { timeout_secs: u64 },
    SetConnections { n: usize },
}

pub struct Worker {
    id: usize,
    cfg: WorkerConfig,
    backend: Backend,
    connections: Vec<Connection>,
    fd_index: HashMap<RawFd, usize>,
    counters: Arc<CountersSlot>,
    commands: Receiver<Command>,
    keep_running: bool,
    hard_shutdown_deadline: Option<Instant>,
    rng: rand::rngs::ThreadRng,
}

const POLL_MAX_MS: i32 = 1000;

impl Worker {
    pub fn new(id: usize, cfg: WorkerConfig, counters: Arc<CountersSlot>, commands: Receiver<Command>) -> std::io::Result<Worker> {
        let backend = Backend::new()?;
        Ok(Worker {
            id,
            cfg,
            backend,
            connections: Vec::new(),
            fd_index: HashMap::new(),
            counters,
            commands,
            keep_running: true,
            hard_shutdown_deadline: None,
            rng: rand::rng(),
        })
    }

    /// Run the worker loop until `Stop` is processed and all connections
    /// have drained (or the hard-shutdown timer fires). Intended to be
    /// called as the body of a spawned OS thread.
    pub fn run(mut self) {
        self.spawn_initial_connections();

        loop {
            self.drain_commands();

            if !self.keep_running && self.all_connections_closed() {
                break;
            }
            if let Some(deadline) = self.hard_shutdown_deadline {
                if Instant::now() >= deadline {
                    tracing::warn!(worker = self.id, "hard-shutdown timer fired, forcing exit");
                    break;
                }
            }

            self.fire_due_timers();

            let timeout_ms = self.compute_timeout_ms();
            let ready = match self.backend.wait(timeout_ms) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "reactor wait failed");
                    continue;
                }
            };
            for (token, interest) in ready {
                let Some(&idx) = self.fd_index.get(&token.0) else {
                    continue;
                };
                self.drive(idx, |conn, backend, cfg, counters, rng| {
                    conn.on_ready(interest, backend, cfg, counters, rng);
                });
            }
        }

        tracing::info!(worker = self.id, "worker loop exited");
    }

    fn spawn_initial_connections(&mut self) {
        for i in 0..self.cfg.connections {
            self.add_connection(i);
        }
    }

    fn add_connection(&mut self, index: usize) {
        let mut conn = Connection::new(index, &mut self.rng);
        conn.start_connect(&self.backend, &self.cfg);
        if let Some(fd) = conn.fd() {
            self.fd_index.insert(fd, self.connections.len());
        }
        self.connections.push(conn);
    }

    /// Run `f` against connection `idx`, then reconcile the fd index if the
    /// operation changed (or removed) its socket.
    fn drive(
        &mut self,
        idx: usize,
        f: impl FnOnce(&mut Connection, &Backend, &WorkerConfig, &CountersSlot, &mut rand::rngs::ThreadRng),
    ) {
        let old_fd = self.connections[idx].fd();
        f(&mut self.connections[idx], &self.backend, &self.cfg, &self.counters, &mut self.rng);
        let new_fd = self.connections[idx].fd();
        if old_fd != new_fd {
            if let Some(fd) = old_fd {
                self.fd_index.remove(&fd);
            }
            if let Some(fd) = new_fd {
                self.fd_index.insert(fd, idx);
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        for idx in 0..self.connections.len() {
            if self.connections[idx].timer_deadline().map(|d| now >= d) == Some(true) {
                self.drive(idx, |conn, backend, cfg, counters, rng| {
                    conn.retry_connect_if_due(now, backend, cfg, rng);
                    conn.think_timer_fired_if_due(now, backend, cfg, counters);
                });
            }
        }
    }

    fn compute_timeout_ms(&self) -> i32 {
        let now = Instant::now();
        let mut next: Option<Duration> = None;
        for conn in &self.connections {
            if let Some(deadline) = conn.timer_deadline() {
                let d = deadline.saturating_duration_since(now);
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        }
        if let Some(deadline) = self.hard_shutdown_deadline {
            let d = deadline.saturating_duration_since(now);
            next = Some(next.map_or(d, |n| n.min(d)));
        }
        match next {
            Some(d) => (d.as_millis() as i32).clamp(0, POLL_MAX_MS),
            None => POLL_MAX_MS,
        }
    }

    fn all_connections_closed(&self) -> bool {
        self.connections.iter().all(Connection::is_closed)
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Stop { timeout_secs } => {
                    tracing::info!(worker = self.id, timeout_secs, "received stop command");
                    self.keep_running = false;
                    for conn in &mut self.connections {
                        conn.request_drain();
                    }
                    self.hard_shutdown_deadline = Some(Instant::now() + Duration::from_secs(timeout_secs));
                }
                Command::SetConnections { n } => self.set_connections(n),
            }
        }
    }

    #[cfg(test)]
    fn connections_for_test(&self) -> &[Connection] {
        &self.connections
    }

    fn set_connections(&mut self, n: usize) {
        self.compact_closed();
        let current = self.connections.len();
        if n > current {
            for i in current..n {
                self.add_connection(i);
            }
        } else if n < current {
            for conn in self.connections[n..].iter_mut() {
                conn.request_drain();
            }
        }
    }

    /// Drop fully-`Closed` connections from `self.connections` and
    /// reindex the survivors, so repeated shrink/grow cycles (spec section
    /// 3's `SetConnections` command) don't leave zombie entries and their
    /// `fd_index` slots behind forever.
    fn compact_closed(&mut self) {
        if !self.connections.iter().any(Connection::is_closed) {
            return;
        }
        self.connections.retain(|conn| !conn.is_closed());
        self.fd_index.clear();
        for (idx, conn) in self.connections.iter_mut().enumerate() {
            conn.index = idx;
            if let Some(fd) = conn.fd() {
                self.fd_index.insert(fd, idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresetHeaders;
    use crate::url::UrlRegistry;

    fn ensure_registry() {
        if !UrlRegistry::is_initialized() {
            let _ = UrlRegistry::init_single("http://127.0.0.1:1/");
        }
    }

    fn test_worker_config() -> WorkerConfig {
        WorkerConfig {
            index: 0,
            connections: 0,
            method: "GET".to_string(),
            body: None,
            content_type: None,
            #[cfg(feature = "tls")]
            tls_context: None,
            oauth: None,
            header_lines: vec![],
            preset_headers: PresetHeaders::default(),
            think_time: Duration::ZERO,
            keep_alive: true,
            one_shot: false,
        }
    }

    fn test_worker() -> Worker {
        ensure_registry();
        let (_tx, rx) = std::sync::mpsc::channel();
        Worker::new(0, test_worker_config(), Arc::new(CountersSlot::new()), rx).expect("worker")
    }

    /// Repeated shrink/grow cycles must not leave `Phase::Closed` zombie
    /// entries behind in `self.connections`/`fd_index` (review: unbounded
    /// growth across `SetConnections`).
    #[test]
    fn set_connections_compacts_closed_entries_before_growing() {
        let mut w = test_worker();
        for i in 0..5 {
            w.add_connection(i);
        }
        assert_eq!(w.connections_for_test().len(), 5);

        for conn in &mut w.connections[2..] {
            conn.force_closed_for_test();
        }
        w.set_connections(2);
        assert_eq!(
            w.connections_for_test().len(),
            2,
            "closed connections should be compacted out, not just marked drained"
        );

        w.set_connections(5);
        assert_eq!(
            w.connections_for_test().len(),
            5,
            "growing after a shrink should reuse the compacted slots, not pile on top of them"
        );
        assert!(w.fd_index.len() <= w.connections.len());
    }

    #[test]
    fn set_connections_is_a_no_op_when_target_matches_current_live_count() {
        let mut w = test_worker();
        for i in 0..3 {
            w.add_connection(i);
        }
        w.set_connections(3);
        assert_eq!(w.connections_for_test().len(), 3);
    }
}
