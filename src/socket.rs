//! C2: non-blocking socket abstraction. Two implementations — plain TCP and
//! TLS-over-TCP — behind one status contract (spec section 4.2), grounded on
//! `examples/original_source/apib/socket.cc`/`tlssocket.cc` for the contract
//! and on `examples/warpy-ai-script/src/runtime/async/tls.rs` for how to
//! drive a `rustls::Connection` by hand (its `process_io`/`flush_tls`/
//! `fill_tls` split, adapted here to non-blocking direct calls that return
//! our `IoStatus` instead of `Poll`).

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::IoStatus;
use crate::resolver::Endpoint;

#[cfg(feature = "tls")]
use rustls::pki_types::ServerName;

/// Sets the socket options spec section 4.2 requires on connect:
/// `TCP_NODELAY`, `SO_REUSEADDR`, `SO_LINGER` disabled, non-blocking.
fn apply_options(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    let fd = stream.as_raw_fd();
    unsafe {
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let linger = libc::linger { l_onoff: 0, l_linger: 0 };
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
    Ok(())
}

/// Begin a non-blocking TCP connect. `connect()` returning "in progress"
/// (`EINPROGRESS`) is treated as success; completion is discovered later
/// through write readiness (spec section 4.2).
pub fn connect_nonblocking(endpoint: &Endpoint) -> io::Result<TcpStream> {
    let addr = endpoint
        .to_socket_addr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address"))?;

    let domain = match addr {
        std::net::SocketAddr::V4(_) => libc::AF_INET,
        std::net::SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let stream = unsafe { <TcpStream as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
    apply_options(&stream)?;

    let (sockaddr, len) = sockaddr_from(&addr);
    let rc = unsafe { libc::connect(fd, &sockaddr as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    Ok(stream)
}

fn sockaddr_from(addr: &std::net::SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        std::net::SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        std::net::SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

fn classify_io_error(e: &io::Error, direction_is_read: bool) -> IoStatus {
    match e.kind() {
        io::ErrorKind::WouldBlock => {
            if direction_is_read {
                IoStatus::NeedRead
            } else {
                IoStatus::NeedWrite
            }
        }
        _ => IoStatus::SocketError(e.raw_os_error().unwrap_or(-1)),
    }
}

/// TLS context shared across connections (spec section 5: "internally
/// synchronized"). Carries the roots/cipher configuration derived from CLI
/// options `-C`/`-F`/`-V`.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsContext {
    config: std::sync::Arc<rustls::ClientConfig>,
}

#[cfg(feature = "tls")]
impl TlsContext {
    pub fn new(verify: bool, ca_bundle: Option<&std::path::Path>) -> Result<Self, crate::error::ApibError> {
        let root_store = if let Some(path) = ca_bundle {
            let mut store = rustls::RootCertStore::empty();
            let pem = std::fs::read(path)
                .map_err(|e| crate::error::ApibError::ConfigError(format!("reading CA bundle: {e}")))?;
            let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<Result<_, _>>()
                .map_err(|e| crate::error::ApibError::ConfigError(format!("parsing CA bundle: {e}")))?;
            let (added, _) = store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(crate::error::ApibError::ConfigError(
                    "CA bundle contained no usable certificates".into(),
                ));
            }
            store
        } else {
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
        };

        let builder = rustls::ClientConfig::builder();
        let config = if verify {
            builder.with_root_certificates(root_store).with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(std::sync::Arc::new(NoVerify))
                .with_no_client_auth()
        };

        Ok(TlsContext {
            config: std::sync::Arc::new(config),
        })
    }
}

#[cfg(feature = "tls")]
#[derive(Debug)]
struct NoVerify;

#[cfg(feature = "tls")]
impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

pub struct Socket {
    pub fd: RawFd,
    inner: SocketInner,
}

enum SocketInner {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(TcpStream, Box<rustls::ClientConnection>),
}

impl Socket {
    pub fn plain(stream: TcpStream) -> Self {
        let fd = stream.as_raw_fd();
        Socket {
            fd,
            inner: SocketInner::Plain(stream),
        }
    }

    #[cfg(feature = "tls")]
    pub fn tls(stream: TcpStream, ctx: &TlsContext, server_name: &str) -> Result<Self, IoStatus> {
        let fd = stream.as_raw_fd();
        let name: ServerName<'static> = server_name
            .to_string()
            .try_into()
            .map_err(|_| IoStatus::TlsError("invalid server name".into()))?;
        let conn = rustls::ClientConnection::new(ctx.config.clone(), name)
            .map_err(|e| IoStatus::TlsError(e.to_string()))?;
        Ok(Socket {
            fd,
            inner: SocketInner::Tls(stream, Box::new(conn)),
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> (usize, IoStatus) {
        match &mut self.inner {
            SocketInner::Plain(s) => match s.read(buf) {
                Ok(0) => (0, IoStatus::Eof),
                Ok(n) => (n, IoStatus::Ok(n)),
                Err(e) => (0, classify_io_error(&e, true)),
            },
            #[cfg(feature = "tls")]
            SocketInner::Tls(stream, conn) => tls_read(stream, conn, buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> (usize, IoStatus) {
        match &mut self.inner {
            SocketInner::Plain(s) => match s.write(buf) {
                Ok(n) => (n, IoStatus::Ok(n)),
                Err(e) => (0, classify_io_error(&e, false)),
            },
            #[cfg(feature = "tls")]
            SocketInner::Tls(stream, conn) => tls_write(stream, conn, buf),
        }
    }

    /// Begin/continue shutdown. May need further I/O for TLS (spec section
    /// 4.2: "close is allowed to suspend").
    pub fn close(&mut self) -> IoStatus {
        match &mut self.inner {
            SocketInner::Plain(s) => match s.shutdown(std::net::Shutdown::Both) {
                Ok(()) => IoStatus::Ok(0),
                Err(e) => classify_io_error(&e, false),
            },
            #[cfg(feature = "tls")]
            SocketInner::Tls(stream, conn) => {
                conn.send_close_notify();
                let (_, status) = flush_tls_output(stream, conn);
                match status {
                    IoStatus::Ok(_) => {
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        IoStatus::Ok(0)
                    }
                    other => other,
                }
            }
        }
    }
}

#[cfg(feature = "tls")]
fn flush_tls_output(
    stream: &mut TcpStream,
    conn: &mut rustls::ClientConnection,
) -> (usize, IoStatus) {
    let mut total = 0;
    while conn.wants_write() {
        let mut buf = Vec::new();
        match conn.write_tls(&mut buf) {
            Ok(0) => break,
            Ok(_) => match stream.write(&buf) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        return (total, IoStatus::NeedWrite);
                    }
                }
                Err(e) => return (total, classify_io_error(&e, false)),
            },
            Err(e) => return (total, IoStatus::TlsError(e.to_string())),
        }
    }
    (total, IoStatus::Ok(total))
}

#[cfg(feature = "tls")]
fn fill_tls_input(stream: &mut TcpStream, conn: &mut rustls::ClientConnection) -> IoStatus {
    let mut buf = [0u8; 16384];
    match stream.read(&mut buf) {
        Ok(0) => IoStatus::Eof,
        Ok(n) => {
            let mut cursor = io::Cursor::new(&buf[..n]);
            match conn.read_tls(&mut cursor) {
                Ok(_) => match conn.process_new_packets() {
                    Ok(_) => IoStatus::Ok(n),
                    Err(e) => IoStatus::TlsError(e.to_string()),
                },
                Err(e) => IoStatus::TlsError(e.to_string()),
            }
        }
        Err(e) => classify_io_error(&e, true),
    }
}

#[cfg(feature = "tls")]
fn tls_write(
    stream: &mut TcpStream,
    conn: &mut rustls::ClientConnection,
    buf: &[u8],
) -> (usize, IoStatus) {
    let n = match conn.writer().write(buf) {
        Ok(n) => n,
        Err(e) => return (0, IoStatus::TlsError(e.to_string())),
    };
    let (_, status) = flush_tls_output(stream, conn);
    match status {
        IoStatus::Ok(_) => (n, IoStatus::Ok(n)),
        other => (n, other),
    }
}

#[cfg(feature = "tls")]
fn tls_read(
    stream: &mut TcpStream,
    conn: &mut rustls::ClientConnection,
    buf: &mut [u8],
) -> (usize, IoStatus) {
    // Drain any ciphertext already available before asking the socket for more.
    loop {
        match conn.reader().read(buf) {
            Ok(0) if conn.is_handshaking() => {}
            Ok(n) if n > 0 => return (n, IoStatus::Ok(n)),
            // `Ok(0)` outside the handshake means the peer sent close_notify,
            // not "no data yet" (that case comes back as WouldBlock instead).
            Ok(_) => return (0, IoStatus::Eof),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return (0, IoStatus::TlsError(e.to_string())),
        }

        if conn.wants_write() {
            let (_, status) = flush_tls_output(stream, conn);
            if let IoStatus::NeedWrite | IoStatus::SocketError(_) = status {
                return (0, status);
            }
        }
        if !conn.wants_read() {
            return (0, IoStatus::NeedRead);
        }
        match fill_tls_input(stream, conn) {
            IoStatus::Ok(_) => continue,
            IoStatus::Eof => return (0, IoStatus::Eof),
            other => return (0, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_nonblocking_to_closed_port_eventually_errors() {
        // 127.0.0.1:1 is very likely to be refused quickly.
        let ep = Endpoint::V4 {
            addr: std::net::Ipv4Addr::new(127, 0, 0, 1),
            port: 1,
        };
        let stream = connect_nonblocking(&ep).expect("non-blocking connect should not fail synchronously");
        assert!(stream.set_nonblocking(false).is_ok());
    }
}
