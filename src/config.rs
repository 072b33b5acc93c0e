//! Process- and worker-level configuration structs (spec section 3
//! `WorkerConfig`), grounded on `examples/original_source/apib/apib_main.c`'s
//! global option state and the per-thread args it hands to `IOThread`.

#[cfg(feature = "tls")]
use std::path::PathBuf;
use std::time::Duration;

use crate::oauth::OAuthCredentials;
#[cfg(feature = "tls")]
use crate::socket::TlsContext;

/// Bitmask of well-known headers the caller already supplied explicitly
/// (spec section 3 `WorkerConfig`), so the request composer does not
/// duplicate them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresetHeaders {
    pub host: bool,
    pub content_type: bool,
    pub content_length: bool,
    pub authorization: bool,
    pub connection: bool,
    pub user_agent: bool,
}

impl PresetHeaders {
    /// Inspect caller-supplied raw header lines and mark which well-known
    /// headers are already present, case-insensitively on the field name.
    pub fn from_header_lines(lines: &[String]) -> PresetHeaders {
        let mut preset = PresetHeaders::default();
        for line in lines {
            let Some((name, _)) = line.split_once(':') else {
                continue;
            };
            match name.trim().to_ascii_lowercase().as_str() {
                "host" => preset.host = true,
                "content-type" => preset.content_type = true,
                "content-length" => preset.content_length = true,
                "authorization" => preset.authorization = true,
                "connection" => preset.connection = true,
                "user-agent" => preset.user_agent = true,
                _ => {}
            }
        }
        preset
    }
}

/// Everything the driver hands a worker at spawn time (spec section 3).
#[derive(Clone)]
pub struct WorkerConfig {
    pub index: usize,
    pub connections: usize,
    pub method: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    #[cfg(feature = "tls")]
    pub tls_context: Option<TlsContext>,
    pub oauth: Option<OAuthCredentials>,
    pub header_lines: Vec<String>,
    pub preset_headers: PresetHeaders,
    pub think_time: Duration,
    pub keep_alive: bool,
    pub one_shot: bool,
}

/// Process-wide configuration derived from the CLI (spec section 6),
/// immutable for the life of the run.
#[derive(Clone)]
pub struct RunConfig {
    pub concurrency: usize,
    pub io_threads: usize,
    pub duration: Duration,
    pub warmup: Duration,
    pub think_time: Duration,
    pub keep_alive: bool,
    pub one_shot: bool,
    pub method: String,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub header_lines: Vec<String>,
    pub oauth: Option<OAuthCredentials>,
    #[cfg(feature = "tls")]
    pub tls_verify: bool,
    #[cfg(feature = "tls")]
    pub tls_cipher_list: Option<String>,
    #[cfg(feature = "tls")]
    pub tls_ca_bundle: Option<PathBuf>,
    pub run_name: String,
    pub csv_output: bool,
    pub monitor: Option<String>,
    pub monitor2: Option<String>,
    pub verbose: bool,
}

impl RunConfig {
    /// Derive one worker's share of the total concurrency. The original
    /// distributes connections round-robin across threads so counts differ
    /// by at most one; this mirrors that instead of truncating.
    pub fn worker_config(
        &self,
        index: usize,
        #[cfg(feature = "tls")] tls_context: Option<TlsContext>,
    ) -> WorkerConfig {
        let base = self.concurrency / self.io_threads;
        let extra = self.concurrency % self.io_threads;
        let connections = base + usize::from(index < extra);
        WorkerConfig {
            index,
            connections,
            method: self.method.clone(),
            body: self.body.clone(),
            content_type: self.content_type.clone(),
            #[cfg(feature = "tls")]
            tls_context,
            oauth: self.oauth.clone(),
            preset_headers: PresetHeaders::from_header_lines(&self.header_lines),
            header_lines: self.header_lines.clone(),
            think_time: self.think_time,
            keep_alive: self.keep_alive,
            one_shot: self.one_shot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_headers_matches_case_insensitively() {
        let lines = vec!["Content-Type: application/json".to_string(), "X-Foo: bar".to_string()];
        let preset = PresetHeaders::from_header_lines(&lines);
        assert!(preset.content_type);
        assert!(!preset.host);
    }

    #[test]
    fn worker_config_distributes_remainder_to_first_workers() {
        let cfg = RunConfig {
            concurrency: 10,
            io_threads: 3,
            duration: Duration::from_secs(1),
            warmup: Duration::ZERO,
            think_time: Duration::ZERO,
            keep_alive: true,
            one_shot: false,
            method: "GET".to_string(),
            body: None,
            content_type: None,
            header_lines: vec![],
            oauth: None,
            #[cfg(feature = "tls")]
            tls_verify: false,
            #[cfg(feature = "tls")]
            tls_cipher_list: None,
            #[cfg(feature = "tls")]
            tls_ca_bundle: None,
            run_name: "run".to_string(),
            csv_output: false,
            monitor: None,
            monitor2: None,
            verbose: false,
        };
        #[cfg(feature = "tls")]
        let counts: Vec<usize> = (0..3).map(|i| cfg.worker_config(i, None).connections).collect();
        #[cfg(not(feature = "tls"))]
        let counts: Vec<usize> = (0..3).map(|i| cfg.worker_config(i).connections).collect();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        assert_eq!(counts, vec![4, 3, 3]);
    }
}
