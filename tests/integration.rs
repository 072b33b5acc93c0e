//! End-to-end tests driving the full `Driver` against a small in-process
//! HTTP/1.1 server, grounded on the spec's component design (C8 runs C6
//! workers which drive C5 connections through real non-blocking sockets) —
//! there is no mock reactor or mock socket layer here, only loopback TCP.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use apib::config::RunConfig;
use apib::driver::Driver;
use apib::url::UrlRegistry;

/// A minimal HTTP/1.1 server: replies 200 OK with a short body, honoring
/// `Connection: close` and otherwise keeping the socket open for reuse.
fn serve_one(mut stream: TcpStream, request_count: &'static AtomicUsize) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    let mut buf = Vec::new();
    let mut scratch = [0u8; 4096];
    loop {
        let header_end = loop {
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
            let n = match stream.read(&mut scratch) {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };
            buf.extend_from_slice(&scratch[..n]);
        };
        let request_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
        request_count.fetch_add(1, Ordering::SeqCst);
        buf.drain(..header_end + 4);

        let close = request_text.to_ascii_lowercase().contains("connection: close");
        let want_404 = request_text.starts_with("GET /missing");
        let (status, body): (&str, &str) = if want_404 {
            ("404 Not Found", "nope")
        } else {
            ("200 OK", "hello")
        };
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{body}",
            body.len(),
            if close { "close" } else { "keep-alive" }
        );
        if stream.write_all(response.as_bytes()).is_err() {
            return;
        }
        if close {
            return;
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

static REQUEST_COUNT: AtomicUsize = AtomicUsize::new(0);
static SERVER_ADDR: OnceLock<String> = OnceLock::new();

/// Starts the loopback server exactly once per test process and returns its
/// address. All tests in this binary share one server and one `UrlRegistry`
/// (a process-wide `OnceLock`, so it can only be populated once).
fn server_addr() -> &'static str {
    SERVER_ADDR.get_or_init(|| {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                match conn {
                    Ok(stream) => {
                        std::thread::spawn(move || serve_one(stream, &REQUEST_COUNT));
                    }
                    Err(_) => break,
                }
            }
        });
        format!("http://{addr}/")
    })
}

fn ensure_registry() {
    if !UrlRegistry::is_initialized() {
        let _ = UrlRegistry::init_single(server_addr());
    }
}

fn base_config() -> RunConfig {
    RunConfig {
        concurrency: 4,
        io_threads: 2,
        duration: Duration::from_millis(400),
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
        run_name: "integration".to_string(),
        csv_output: false,
        monitor: None,
        monitor2: None,
        verbose: false,
    }
}

#[test]
fn driver_completes_many_keepalive_requests_with_no_errors() {
    ensure_registry();
    let report = Driver::new(base_config()).run().expect("driver run");
    assert!(report.aggregate.successful_requests > 0);
    assert_eq!(report.aggregate.failed_requests, 0);
    assert_eq!(report.connections, 4);
    assert_eq!(report.threads, 2);
    // Keep-alive reuses each connection for many requests, so the number of
    // sockets actually opened should be far below the successful-request count.
    assert!(report.aggregate.connections_opened > 0);
    assert!(report.aggregate.connections_opened <= report.aggregate.successful_requests);
    // Each of the 4 connections must be reused for more than one request over
    // the run, not just opened once and left to hang after its first reply.
    assert!(
        report.aggregate.successful_requests > report.aggregate.connections_opened,
        "expected keep-alive reuse (successful={}, opened={})",
        report.aggregate.successful_requests,
        report.aggregate.connections_opened
    );
}

#[test]
fn one_shot_mode_closes_after_a_single_response_per_connection() {
    ensure_registry();
    let mut cfg = base_config();
    cfg.one_shot = true;
    cfg.duration = Duration::from_millis(300);
    let report = Driver::new(cfg).run().expect("driver run");
    // Every connection still completes at least one request, but one-shot
    // connections close rather than pipelining a second request immediately.
    assert!(report.aggregate.successful_requests > 0);
    assert!(report.aggregate.successful_requests as usize <= 4 * 50);
}

#[test]
fn keep_alive_disabled_forces_reconnect_between_every_request() {
    ensure_registry();
    let mut cfg = base_config();
    cfg.keep_alive = false;
    let report = Driver::new(cfg).run().expect("driver run");
    assert!(report.aggregate.successful_requests > 0);
    assert_eq!(report.aggregate.failed_requests, 0);
}

#[test]
fn non_2xx_status_is_recorded_as_failed_not_successful() {
    ensure_registry();
    // Point only one worker's traffic at the 404 path by overriding the
    // header-less GET target isn't possible per-connection here, so this
    // test instead checks the aggregate accounting directly via Aggregate.
    let agg = apib::stats::Aggregate::from_totals(3, 1, 100, 50, 2, 1.0, vec![1_000, 2_000, 3_000]);
    assert_eq!(agg.completed_requests(), 4);
    assert_eq!(agg.successful_requests, 3);
    assert_eq!(agg.failed_requests, 1);
}

#[test]
fn csv_and_human_reports_cover_a_real_driver_run() {
    ensure_registry();
    let report = Driver::new(base_config()).run().expect("driver run");
    let csv = apib::reporting::format_csv(&report);
    let human = apib::reporting::format_human(&report);
    assert_eq!(csv.split(',').count(), apib::reporting::csv_header().split(',').count());
    assert!(human.contains("Throughput"));
}
