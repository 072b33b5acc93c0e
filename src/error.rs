use std::fmt;

/// Error kinds of the engine (spec section 7). Per-request variants
/// (`SocketError`, `TlsError`, `HttpParseError`) are recorded into the
/// statistics layer by the connection state machine and never escape a
/// worker thread as a `Result`; only the startup-time variants propagate
/// out of `main`.
#[derive(Debug, thiserror::Error)]
pub enum ApibError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("DNS lookup failed for {host}: {detail}")]
    DnsFailure { host: String, detail: String },

    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("HTTP parse error: {0}")]
    HttpParseError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("input file error: {0}")]
    InputFileError(String),

    #[error("file descriptor limit error: {0}")]
    RlimitFailure(String),

    #[error("fatal internal error: {0}")]
    Fatal(String),
}

/// Status code returned by socket/TLS operations (spec section 4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoStatus {
    Ok(usize),
    Eof,
    NeedRead,
    NeedWrite,
    SocketError(i32),
    TlsError(String),
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStatus::Ok(n) => write!(f, "ok({n})"),
            IoStatus::Eof => write!(f, "eof"),
            IoStatus::NeedRead => write!(f, "need-read"),
            IoStatus::NeedWrite => write!(f, "need-write"),
            IoStatus::SocketError(e) => write!(f, "socket-error({e})"),
            IoStatus::TlsError(d) => write!(f, "tls-error({d})"),
        }
    }
}

/// Exit codes per spec section 6. `RLIMIT_FAILURE` also covers the
/// `@file`-with-unreadable-file case, matching the distinct setup-failure
/// path `examples/original_source/apib_main.cc`'s `initializeThread` takes
/// for both `readFile` and `setrlimit` failures.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const USAGE_ERROR: i32 = 1;
    pub const SETUP_FAILURE: i32 = 2;
    pub const RLIMIT_FAILURE: i32 = 3;
}
