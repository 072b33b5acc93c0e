//! C4: URL registry. A process-wide immutable table of parsed target URLs,
//! grounded on `examples/original_source/apib/apib_url.cc`.

use std::sync::OnceLock;

use rand::Rng;

use crate::error::ApibError;
use crate::resolver::{self, EndpointSet, FamilyHint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Https)
    }
}

/// A parsed target URL. Immutable after construction (spec section 3).
#[derive(Debug, Clone)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path_only: String,
    pub raw_query: Option<String>,
    /// path + "?" + query + "#" + fragment, as sent on the request line.
    pub path: String,
    /// `Host` header value: host, or host:port when the port is non-default.
    pub host_header: String,
    pub endpoints: EndpointSet,
}

impl Url {
    /// Parse and resolve a single URL string. Mirrors `URLInfo::init`:
    /// scheme/host/port/path/query extraction, default-port Host header
    /// suppression, and DNS resolution (a lookup failure yields an empty
    /// `EndpointSet`, not a hard error — spec section 7 `DnsFailure`
    /// "connection attempts using that URL fail fast").
    pub fn parse(raw: &str) -> Result<Url, ApibError> {
        let (scheme_str, rest) = raw
            .split_once("://")
            .ok_or_else(|| ApibError::InvalidUrl(raw.to_string()))?;

        let scheme = match scheme_str {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(ApibError::InvalidUrl(format!("invalid scheme in {raw}"))),
        };

        let (authority, path_and_rest) = match rest.find('/') {
            Some(ix) => (&rest[..ix], &rest[ix..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(ApibError::InvalidUrl(raw.to_string()));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() && p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| ApibError::InvalidUrl(format!("invalid port in {raw}")))?;
                (h.to_string(), port)
            }
            _ => (authority.to_string(), scheme.default_port()),
        };

        let (path_and_query, fragment) = match path_and_rest.split_once('#') {
            Some((p, f)) => (p, Some(f)),
            None => (path_and_rest, None),
        };
        let (path_only, raw_query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        let path_only = if path_only.is_empty() { "/".to_string() } else { path_only };

        let mut path = path_only.clone();
        if let Some(q) = &raw_query {
            path.push('?');
            path.push_str(q);
        }
        if let Some(f) = fragment {
            path.push('#');
            path.push_str(f);
        }

        let host_header = if (scheme.is_tls() && port == 443) || (!scheme.is_tls() && port == 80) {
            host.clone()
        } else {
            format!("{host}:{port}")
        };

        let endpoints = resolver::lookup(&host, FamilyHint::Any).unwrap_or_default();

        Ok(Url {
            scheme,
            host,
            port,
            path_only,
            raw_query,
            path,
            host_header,
            endpoints,
        })
    }

    pub fn endpoint_at(&self, sequence: usize) -> resolver::Endpoint {
        self.endpoints.get(self.port, sequence)
    }
}

/// Process-wide ordered sequence of `Url`s, populated exactly once.
pub struct UrlRegistry {
    urls: Vec<Url>,
}

static REGISTRY: OnceLock<UrlRegistry> = OnceLock::new();

impl UrlRegistry {
    /// Populate the registry from a single URL string. May be called exactly
    /// once per process.
    pub fn init_single(url_str: &str) -> Result<(), ApibError> {
        let url = Url::parse(url_str)?;
        REGISTRY
            .set(UrlRegistry { urls: vec![url] })
            .map_err(|_| ApibError::Fatal("URL registry already initialized".into()))
    }

    /// Populate the registry from a newline-separated file of URLs.
    pub fn init_file(path: &std::path::Path) -> Result<(), ApibError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ApibError::InputFileError(format!("reading {}: {e}", path.display())))?;
        let mut urls = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            urls.push(Url::parse(line)?);
        }
        if urls.is_empty() {
            return Err(ApibError::ConfigError(format!(
                "{} contains no URLs",
                path.display()
            )));
        }
        tracing::info!(count = urls.len(), file = %path.display(), "read URLs from file");
        REGISTRY
            .set(UrlRegistry { urls })
            .map_err(|_| ApibError::Fatal("URL registry already initialized".into()))
    }

    pub fn is_initialized() -> bool {
        REGISTRY.get().is_some()
    }

    fn get() -> &'static UrlRegistry {
        REGISTRY
            .get()
            .expect("UrlRegistry must be initialized before use")
    }

    /// Returns a uniformly-selected URL. A single-entry registry returns it
    /// deterministically (no RNG draw needed).
    pub fn next(rng: &mut impl Rng) -> &'static Url {
        let reg = Self::get();
        if reg.urls.len() == 1 {
            return &reg.urls[0];
        }
        let ix = rng.random_range(0..reg.urls.len());
        &reg.urls[ix]
    }

    pub fn len() -> usize {
        Self::get().urls.len()
    }

    /// Endpoint equality at round-robin slot `sequence` for `u1` and `u2`.
    pub fn is_same_server(u1: &Url, u2: &Url, sequence: usize) -> bool {
        u1.endpoint_at(sequence) == u2.endpoint_at(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_scheme_host_path_query() {
        let u = Url::parse("http://example.com:8080/foo/bar?x=1").unwrap();
        assert_eq!(u.scheme, Scheme::Http);
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 8080);
        assert_eq!(u.path_only, "/foo/bar");
        assert_eq!(u.raw_query.as_deref(), Some("x=1"));
        assert_eq!(u.host_header, "example.com:8080");
        assert_eq!(u.path, "/foo/bar?x=1");
    }

    #[test]
    fn default_port_suppressed_in_host_header() {
        let u = Url::parse("https://example.com/hello").unwrap();
        assert_eq!(u.port, 443);
        assert_eq!(u.host_header, "example.com");
    }

    #[test]
    fn no_path_defaults_to_slash() {
        let u = Url::parse("http://example.com").unwrap();
        assert_eq!(u.path_only, "/");
        assert_eq!(u.path, "/");
    }

    #[test]
    fn rejects_invalid_scheme() {
        assert!(Url::parse("ftp://example.com/").is_err());
    }
}
