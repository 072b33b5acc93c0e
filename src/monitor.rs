//! External CPU/memory monitor: client side of the line protocol (spec
//! section 6) plus the `/proc`-based local sampling shared with the
//! reference server binary (`src/bin/apib_monitor.rs`), grounded on
//! `examples/original_source/apib_mon.c` (protocol shape) and
//! `examples/original_source/src/apib_cpu_proc.c` (tick/memory math).

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to a remote monitor, speaking `HELLO`/`CPU`/`MEM`/`BYE`.
/// Any I/O failure demotes monitoring to "unavailable" (spec section 4.7)
/// rather than aborting the run — callers see `None` from `cpu`/`mem`.
pub struct Client {
    stream: Option<TcpStream>,
}

impl Client {
    /// Connect and send `HELLO`, expecting `Hi!`. Returns `Err` (caller
    /// demotes to unavailable) on any failure.
    pub fn connect(addr: &str) -> Result<Client, crate::error::ApibError> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| crate::error::ApibError::ConfigError(format!("connecting to monitor {addr}: {e}")))?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
        stream.set_write_timeout(Some(CONNECT_TIMEOUT)).ok();
        let mut client = Client { stream: Some(stream) };
        match client.roundtrip("HELLO") {
            Some(reply) if reply.trim() == "Hi!" => Ok(client),
            _ => Err(crate::error::ApibError::ConfigError(format!(
                "monitor {addr} did not respond to HELLO"
            ))),
        }
    }

    fn roundtrip(&mut self, cmd: &str) -> Option<String> {
        let stream = self.stream.as_mut()?;
        if writeln!(stream, "{cmd}").is_err() {
            self.stream = None;
            return None;
        }
        let mut reader = BufReader::new(stream.try_clone().ok()?);
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => {
                self.stream = None;
                None
            }
            Ok(_) => Some(line),
        }
    }

    /// Marks the start of a fresh measurement window (warm-up discard).
    pub fn reset(&mut self) {
        // No explicit reset command in the protocol; the server tracks CPU
        // deltas since its own last `CPU` call, so issuing one now discards
        // the warm-up interval the same way the driver's own counters do.
        let _ = self.roundtrip("CPU");
    }

    /// `CPU\n` -> decimal fraction 0.0-1.0 of non-idle CPU since last call.
    pub fn cpu(&mut self) -> Option<f64> {
        self.roundtrip("CPU").and_then(|r| r.trim().parse::<f64>().ok())
    }

    /// `MEM\n` -> decimal fraction of used memory.
    pub fn mem(&mut self) -> Option<f64> {
        self.roundtrip("MEM").and_then(|r| r.trim().parse::<f64>().ok())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.roundtrip("BYE");
    }
}

/// Local `/proc`-based sampling, used both by the reference monitor server
/// and (for the client-side "avg client CPU %" figure) directly by the
/// driver on Linux.
pub mod local {
    use std::fs;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct CpuTicks {
        pub user: u64,
        pub nice: u64,
        pub system: u64,
        pub idle: u64,
        pub io_wait: u64,
    }

    /// Parses the aggregate `cpu ` line of `/proc/stat`.
    pub fn read_cpu_ticks() -> Option<CpuTicks> {
        let contents = fs::read_to_string("/proc/stat").ok()?;
        let line = contents.lines().find(|l| l.starts_with("cpu "))?;
        let mut fields = line.split_whitespace().skip(1).map(|f| f.parse::<u64>().unwrap_or(0));
        Some(CpuTicks {
            user: fields.next().unwrap_or(0),
            nice: fields.next().unwrap_or(0),
            system: fields.next().unwrap_or(0),
            idle: fields.next().unwrap_or(0),
            io_wait: fields.next().unwrap_or(0),
        })
    }

    /// Non-idle fraction since `prev`, per `apib_cpu.c`'s `cpu_GetInterval`
    /// (idle-tick delta over total-tick delta, inverted).
    pub fn cpu_fraction_since(prev: &CpuTicks, now: &CpuTicks) -> Option<f64> {
        let total_prev = prev.user + prev.nice + prev.system + prev.idle + prev.io_wait;
        let total_now = now.user + now.nice + now.system + now.idle + now.io_wait;
        let total_delta = total_now.checked_sub(total_prev)?;
        if total_delta == 0 {
            return None;
        }
        let idle_delta = now.idle.checked_sub(prev.idle)?;
        Some(1.0 - (idle_delta as f64 / total_delta as f64))
    }

    /// `(total - (free + buffers + cached)) / total`, per `apib_cpu_proc.c`'s
    /// `cpu_GetMemoryUsage`.
    pub fn mem_fraction() -> Option<f64> {
        let contents = fs::read_to_string("/proc/meminfo").ok()?;
        let mut total = 0u64;
        let mut free = 0u64;
        let mut buffers = 0u64;
        let mut cached = 0u64;
        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let value: u64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            match name {
                "MemTotal:" => total = value,
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }
        if total == 0 || free == 0 {
            return None;
        }
        Some((total - (free + buffers + cached)) as f64 / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::local::*;

    #[test]
    fn cpu_fraction_is_between_zero_and_one_for_plausible_deltas() {
        let prev = CpuTicks { user: 100, nice: 0, system: 50, idle: 850, io_wait: 0 };
        let now = CpuTicks { user: 150, nice: 0, system: 80, idle: 870, io_wait: 0 };
        let frac = cpu_fraction_since(&prev, &now).unwrap();
        assert!((0.0..=1.0).contains(&frac));
    }

    #[test]
    fn cpu_fraction_none_when_no_tick_progress() {
        let t = CpuTicks::default();
        assert!(cpu_fraction_since(&t, &t).is_none());
    }

    #[test]
    fn mem_fraction_matches_formula_on_sample_values() {
        // total=1000, free=200, buffers=50, cached=150 -> used=600 -> 0.6
        let total = 1000u64;
        let free = 200u64;
        let buffers = 50u64;
        let cached = 150u64;
        let frac = (total - (free + buffers + cached)) as f64 / total as f64;
        assert!((frac - 0.6).abs() < 1e-9);
    }
}
