//! C5: the connection state machine — the central subsystem, grounded on
//! `examples/original_source/apib/apib_iothread.cc`'s `ConnectionState` and
//! its `ConnectionStateMachine` dispatch table.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::error::IoStatus;
use crate::oauth;
use crate::parser::ResponseParser;
use crate::reactor::{Backend, Interest};
use crate::resolver::Endpoint;
use crate::socket::{self, Socket};
use crate::stats::CountersSlot;
use crate::url::{Url, UrlRegistry};
use crate::config::WorkerConfig;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Writing,
    Reading,
    Thinking,
    Closing,
    Closed,
}

/// One client connection, owned by exactly one worker (spec section 3/4.5).
pub struct Connection {
    pub index: usize,
    phase: Phase,
    socket: Option<Socket>,
    current_url: &'static Url,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    write_dirty: bool,
    needs_open: bool,
    parser: ResponseParser,
    start_time: Instant,
    backwards: bool,
    last_interest: Interest,
    keep_running: bool,
    retry_deadline: Option<Instant>,
    think_deadline: Option<Instant>,
}

impl Connection {
    /// Construct a connection in `Idle` with an initial URL selected. The
    /// caller must follow up with `start_connect` once it has a `Backend` to
    /// register interest against (the `Idle -> Connecting` transition, spec
    /// section 4.5).
    pub fn new(index: usize, rng: &mut impl Rng) -> Connection {
        let url = UrlRegistry::next(rng);
        Connection {
            index,
            phase: Phase::Idle,
            socket: None,
            current_url: url,
            read_buf: Vec::with_capacity(8192),
            write_buf: Vec::new(),
            write_pos: 0,
            write_dirty: true,
            needs_open: true,
            parser: ResponseParser::new(),
            start_time: Instant::now(),
            backwards: false,
            last_interest: Interest::Writable,
            keep_running: true,
            retry_deadline: None,
            think_deadline: None,
        }
    }

    /// `Idle -> Connecting`: begin the first connect attempt.
    pub fn start_connect(&mut self, backend: &Backend, cfg: &WorkerConfig) {
        self.start_connect_with(backend, cfg);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.socket.as_ref().map(|s| s.fd)
    }

    /// Clears `keep_running`; the connection drains to the next
    /// `read_done`/`close_done` boundary rather than stopping mid-flight
    /// (spec section 4.6 `SetConnections` shrink / `Stop`).
    pub fn request_drain(&mut self) {
        self.keep_running = false;
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    #[cfg(test)]
    pub(crate) fn force_closed_for_test(&mut self) {
        self.socket = None;
        self.phase = Phase::Closed;
    }

    /// Next wake deadline this connection is waiting on (retry backoff or
    /// think-time), if it currently has no fd-readiness interest.
    pub fn timer_deadline(&self) -> Option<Instant> {
        self.retry_deadline.or(self.think_deadline)
    }

    /// Retry a connect that is due (backoff elapsed).
    pub fn retry_connect_if_due(&mut self, now: Instant, backend: &Backend, cfg: &WorkerConfig, rng: &mut impl Rng) {
        if self.phase != Phase::Connecting {
            return;
        }
        if let Some(deadline) = self.retry_deadline {
            if now >= deadline {
                self.current_url = UrlRegistry::next(rng);
                self.start_connect_with(backend, cfg);
            }
        }
    }

    fn start_connect_with(&mut self, backend: &Backend, cfg: &WorkerConfig) {
        self.phase = Phase::Connecting;
        self.needs_open = true;
        self.start_time = Instant::now();
        let endpoint = self.current_url.endpoint_at(self.index);
        if endpoint == Endpoint::Unspecified {
            self.socket = None;
            self.retry_deadline = Some(Instant::now() + RETRY_BACKOFF);
            return;
        }
        let stream = match socket::connect_nonblocking(&endpoint) {
            Ok(s) => s,
            Err(_) => {
                self.retry_deadline = Some(Instant::now() + RETRY_BACKOFF);
                return;
            }
        };
        let sock_result: Result<Socket, IoStatus> = if self.current_url.scheme.is_tls() {
            #[cfg(feature = "tls")]
            {
                match &cfg.tls_context {
                    Some(ctx) => Socket::tls(stream, ctx, &self.current_url.host),
                    None => Err(IoStatus::TlsError("no TLS context configured".into())),
                }
            }
            #[cfg(not(feature = "tls"))]
            {
                let _ = cfg;
                Err(IoStatus::TlsError("TLS support not compiled in".into()))
            }
        } else {
            Ok(Socket::plain(stream))
        };
        match sock_result {
            Ok(sock) => {
                let fd = sock.fd;
                self.socket = Some(sock);
                self.last_interest = Interest::Writable;
                let _ = backend.register(fd, Interest::Writable);
                self.retry_deadline = None;
            }
            Err(_) => {
                self.retry_deadline = Some(Instant::now() + RETRY_BACKOFF);
            }
        }
    }

    /// Think-time timer fired: reissue the request, skipping reconnection if
    /// the prior recycle kept the socket open.
    pub fn think_timer_fired_if_due(&mut self, now: Instant, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        if self.phase != Phase::Thinking {
            return;
        }
        if let Some(deadline) = self.think_deadline {
            if now >= deadline {
                self.think_deadline = None;
                self.begin_write(backend, cfg, counters);
            }
        }
    }

    fn build_request(&mut self, cfg: &WorkerConfig) {
        let mut buf = Vec::with_capacity(256 + cfg.body.as_ref().map_or(0, Vec::len));
        buf.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", cfg.method, self.current_url.path).as_bytes(),
        );
        if !cfg.preset_headers.user_agent {
            buf.extend_from_slice(b"User-Agent: apib/1.0\r\n");
        }
        if !cfg.preset_headers.host {
            buf.extend_from_slice(format!("Host: {}\r\n", self.current_url.host_header).as_bytes());
        }
        let body_len = cfg.body.as_ref().map(Vec::len).unwrap_or(0);
        if cfg.body.is_some() {
            if !cfg.preset_headers.content_type {
                let ct = cfg.content_type.as_deref().unwrap_or("text/plain");
                buf.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
            }
            if !cfg.preset_headers.content_length {
                buf.extend_from_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
            }
        }
        if let Some(creds) = &cfg.oauth {
            if !cfg.preset_headers.authorization {
                let mut rng = rand::rng();
                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let url_no_query = format!(
                    "{}://{}{}",
                    if self.current_url.scheme.is_tls() { "https" } else { "http" },
                    self.current_url.host_header,
                    self.current_url.path_only,
                );
                let query_params = self
                    .current_url
                    .raw_query
                    .as_deref()
                    .map(parse_query_params)
                    .unwrap_or_default();
                let header = oauth::sign_request(creds, &cfg.method, &url_no_query, &query_params, ts, &mut rng);
                buf.extend_from_slice(format!("Authorization: {header}\r\n").as_bytes());
            }
        }
        if !cfg.keep_alive && !cfg.preset_headers.connection {
            buf.extend_from_slice(b"Connection: close\r\n");
        }
        for line in &cfg.header_lines {
            buf.extend_from_slice(line.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        if let Some(body) = &cfg.body {
            buf.extend_from_slice(body);
        }
        self.write_buf = buf;
        self.write_pos = 0;
        self.write_dirty = false;
    }

    fn begin_write(&mut self, backend: &Backend, cfg: &WorkerConfig, _counters: &CountersSlot) {
        if self.needs_open {
            self.start_connect_with(backend, cfg);
            return;
        }
        if self.write_dirty || cfg.oauth.is_some() {
            self.build_request(cfg);
        }
        self.write_pos = 0;
        self.parser.reset();
        self.read_buf.clear();
        self.start_time = Instant::now();
        self.phase = Phase::Writing;
        if let Some(sock) = &self.socket {
            let fd = sock.fd;
            self.last_interest = Interest::Writable;
            let _ = backend.reregister(fd, Interest::Writable);
        }
    }

    /// Readiness callback: the reactor observed `interest` ready on this
    /// connection's fd.
    pub fn on_ready(
        &mut self,
        interest: Interest,
        backend: &Backend,
        cfg: &WorkerConfig,
        counters: &CountersSlot,
        rng: &mut impl Rng,
    ) {
        if self.backwards {
            tracing::trace!(
                conn = self.index,
                ?interest,
                last_interest = ?self.last_interest,
                "resuming after backwards TLS direction inversion",
            );
        }
        match self.phase {
            Phase::Connecting => self.drive_connecting(backend, cfg, counters),
            Phase::Writing => self.drive_writing(interest, backend, cfg, counters),
            Phase::Reading => self.drive_reading(interest, backend, cfg, counters, rng),
            Phase::Closing => self.drive_closing(backend, cfg, counters),
            Phase::Idle | Phase::Thinking | Phase::Closed => {}
        }
    }

    fn drive_connecting(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        let Some(sock) = &self.socket else { return };
        let err = unsafe {
            let mut errv: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            libc::getsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut errv as *mut _ as *mut libc::c_void,
                &mut len,
            );
            errv
        };
        if err != 0 {
            counters.with_current(|c| c.record_failure());
            let _ = backend.deregister(sock.fd);
            self.socket = None;
            self.retry_deadline = Some(Instant::now() + RETRY_BACKOFF);
            self.phase = Phase::Connecting;
            return;
        }
        self.needs_open = false;
        counters.with_current(|c| c.record_connection_opened());
        self.begin_write(backend, cfg, counters);
    }

    fn drive_writing(&mut self, interest: Interest, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        let Some(fd) = self.socket.as_ref().map(|s| s.fd) else { return };
        loop {
            if self.write_pos >= self.write_buf.len() {
                break;
            }
            let sock = self.socket.as_mut().expect("socket present while writing");
            let (n, status) = sock.write(&self.write_buf[self.write_pos..]);
            if n > 0 {
                self.write_pos += n;
                counters.with_current(|c| c.add_bytes_written(n as u64));
            }
            match status {
                IoStatus::Ok(_) => continue,
                IoStatus::NeedWrite => {
                    self.set_interest(backend, fd, Interest::Writable, false);
                    return;
                }
                IoStatus::NeedRead => {
                    self.set_interest(backend, fd, Interest::Readable, true);
                    return;
                }
                IoStatus::Eof | IoStatus::SocketError(_) | IoStatus::TlsError(_) => {
                    self.fail_and_reconnect(backend, cfg, counters);
                    return;
                }
            }
        }
        let _ = interest;
        self.phase = Phase::Reading;
        self.set_interest(backend, fd, Interest::Readable, false);
    }

    fn set_interest(&mut self, backend: &Backend, fd: std::os::unix::io::RawFd, wanted: Interest, backwards: bool) {
        self.backwards = backwards;
        self.last_interest = wanted;
        let _ = backend.reregister(fd, wanted);
    }

    fn drive_reading(
        &mut self,
        _interest: Interest,
        backend: &Backend,
        cfg: &WorkerConfig,
        counters: &CountersSlot,
        rng: &mut impl Rng,
    ) {
        let mut scratch = [0u8; 8192];
        loop {
            let Some(fd) = self.socket.as_ref().map(|s| s.fd) else { return };
            let sock = self.socket.as_mut().expect("socket present while reading");
            let (n, status) = sock.read(&mut scratch);
            if n > 0 {
                self.read_buf.extend_from_slice(&scratch[..n]);
                counters.with_current(|c| c.add_bytes_read(n as u64));
            }
            match status {
                IoStatus::Ok(_) => {
                    let consumed = self.parser.feed(&self.read_buf);
                    self.read_buf.drain(..consumed);
                    if self.parser_errored() {
                        self.fail_parse_and_reconnect(backend, cfg, counters);
                        return;
                    }
                    if self.parser.is_done() {
                        self.on_response_complete(backend, cfg, counters, rng);
                        return;
                    }
                    continue;
                }
                IoStatus::Eof => {
                    let consumed = self.parser.feed(&self.read_buf);
                    self.read_buf.drain(..consumed);
                    if self.parser.is_done() {
                        self.on_response_complete(backend, cfg, counters, rng);
                    } else {
                        self.fail_and_reconnect(backend, cfg, counters);
                    }
                    return;
                }
                IoStatus::NeedRead => {
                    self.set_interest(backend, fd, Interest::Readable, false);
                    return;
                }
                IoStatus::NeedWrite => {
                    self.set_interest(backend, fd, Interest::Writable, true);
                    return;
                }
                IoStatus::SocketError(_) | IoStatus::TlsError(_) => {
                    self.fail_and_reconnect(backend, cfg, counters);
                    return;
                }
            }
        }
    }

    fn parser_errored(&self) -> bool {
        self.parser.is_error()
    }

    fn on_response_complete(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot, rng: &mut impl Rng) {
        let latency = self.start_time.elapsed();
        let status_code = self.parser.status_code();
        counters.with_current(|c| c.record_response(status_code, latency.as_nanos() as u64));

        if cfg.one_shot {
            self.keep_running = false;
        }

        let response_allows_keepalive = !self.parser.should_close();
        let close = if !response_allows_keepalive || !cfg.keep_alive || !self.keep_running {
            true
        } else {
            let next_url = UrlRegistry::next(rng);
            if !std::ptr::eq(next_url, self.current_url) {
                let same_server = UrlRegistry::is_same_server(self.current_url, next_url, self.index);
                self.current_url = next_url;
                self.write_dirty = true;
                !same_server
            } else {
                false
            }
        };

        if close {
            self.begin_close(backend, cfg, counters);
        } else {
            self.recycle_open(backend, cfg, counters);
        }
    }

    fn recycle_open(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        if cfg.think_time.is_zero() {
            self.begin_write(backend, cfg, counters);
        } else {
            self.phase = Phase::Thinking;
            self.think_deadline = Some(Instant::now() + cfg.think_time);
            if let Some(sock) = &self.socket {
                let _ = backend.deregister(sock.fd);
            }
        }
    }

    fn begin_close(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        self.phase = Phase::Closing;
        self.needs_open = true;
        self.write_dirty = true;
        self.drive_closing(backend, cfg, counters);
    }

    fn drive_closing(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        let Some(sock) = &mut self.socket else {
            self.close_done(backend, cfg, counters);
            return;
        };
        let fd = sock.fd;
        let status = sock.close();
        match status {
            IoStatus::Ok(_) | IoStatus::Eof => {
                let _ = backend.deregister(fd);
                self.socket = None;
                self.close_done(backend, cfg, counters);
            }
            IoStatus::NeedRead => self.set_interest(backend, fd, Interest::Readable, true),
            IoStatus::NeedWrite => self.set_interest(backend, fd, Interest::Writable, false),
            IoStatus::SocketError(_) | IoStatus::TlsError(_) => {
                let _ = backend.deregister(fd);
                self.socket = None;
                self.close_done(backend, cfg, counters);
            }
        }
    }

    fn close_done(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        if self.keep_running {
            self.begin_write(backend, cfg, counters);
        } else {
            self.phase = Phase::Closed;
        }
    }

    fn fail_and_reconnect(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        counters.with_current(|c| c.record_failure());
        if let Some(sock) = &self.socket {
            let _ = backend.deregister(sock.fd);
        }
        self.socket = None;
        self.needs_open = true;
        self.write_dirty = true;
        if self.keep_running {
            self.retry_deadline = Some(Instant::now() + RETRY_BACKOFF);
            self.phase = Phase::Connecting;
        } else {
            self.phase = Phase::Closed;
        }
        let _ = cfg;
    }

    fn fail_parse_and_reconnect(&mut self, backend: &Backend, cfg: &WorkerConfig, counters: &CountersSlot) {
        counters.with_current(|c| c.record_failure());
        if let Some(sock) = &self.socket {
            let _ = backend.deregister(sock.fd);
        }
        self.socket = None;
        self.needs_open = true;
        self.write_dirty = true;
        if self.keep_running {
            self.phase = Phase::Connecting;
            self.retry_deadline = Some(Instant::now());
        } else {
            self.phase = Phase::Closed;
        }
        let _ = cfg;
    }
}

fn parse_query_params(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    static REGISTRY_INIT: OnceLock<()> = OnceLock::new();
    fn ensure_registry() {
        REGISTRY_INIT.get_or_init(|| {
            let _ = UrlRegistry::init_single("http://127.0.0.1:1/");
        });
    }

    /// Per spec section 4.5: a TLS session can ask for the opposite direction
    /// of the caller's current operation; `set_interest` records that in
    /// `backwards`, and the next forward-direction call clears it again.
    #[test]
    fn set_interest_tracks_backwards_flag_and_clears_on_restore() {
        ensure_registry();
        let mut rng = rand::rng();
        let mut conn = Connection::new(0, &mut rng);
        let backend = Backend::new().expect("reactor backend");

        conn.set_interest(&backend, -1, Interest::Readable, true);
        assert!(conn.backwards);
        assert_eq!(conn.last_interest, Interest::Readable);

        conn.set_interest(&backend, -1, Interest::Writable, false);
        assert!(!conn.backwards);
        assert_eq!(conn.last_interest, Interest::Writable);
    }
}
