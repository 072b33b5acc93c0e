//! Reference server for the external CPU/memory monitor protocol (spec
//! section 6), grounded on `examples/original_source/apib_mon_main.c` /
//! `apib_mon.c` (one thread per connection, line-oriented commands).

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

use apib::monitor::local::{cpu_fraction_since, mem_fraction, read_cpu_ticks, CpuTicks};

fn handle_client(stream: TcpStream) -> std::io::Result<()> {
    let peer = stream.peer_addr().ok();
    tracing::info!(?peer, "monitor client connected");
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut last_ticks: Option<CpuTicks> = None;

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        let cmd = line.trim();
        match cmd {
            "HELLO" => {
                writer.write_all(b"Hi!\n")?;
            }
            "CPU" => {
                let now = read_cpu_ticks();
                let reply = match (last_ticks, now) {
                    (Some(prev), Some(now)) => cpu_fraction_since(&prev, &now),
                    _ => None,
                };
                last_ticks = now;
                match reply {
                    Some(frac) => writer.write_all(format!("{frac:.4}\n").as_bytes())?,
                    None => writer.write_all(b"0.0\n")?,
                }
            }
            "MEM" => {
                let frac = mem_fraction().unwrap_or(0.0);
                writer.write_all(format!("{frac:.4}\n").as_bytes())?;
            }
            "BYE" | "QUIT" => {
                writer.write_all(b"BYE\n")?;
                break;
            }
            _ => {
                writer.write_all(b"Invalid command\n")?;
            }
        }
    }
    tracing::info!(?peer, "monitor client disconnected");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let bind_addr = args.next().unwrap_or_else(|| "0.0.0.0:8125".to_string());

    let listener = match TcpListener::bind(&bind_addr) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("apib-monitor: failed to bind {bind_addr}: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(addr = %bind_addr, "apib-monitor listening");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                std::thread::spawn(move || {
                    if let Err(e) = handle_client(stream) {
                        tracing::warn!(error = %e, "monitor client handler exited with error");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}
