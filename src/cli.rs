//! CLI surface (spec section 6), grounded on
//! `examples/original_source/apib_main.c`'s argument loop — option
//! semantics and defaults are mirrored exactly; parsing mechanics use
//! `clap`'s derive API the way the rest of the retrieval pack's CLI crates
//! do.

use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;

use crate::config::{PresetHeaders, RunConfig};
use crate::error::ApibError;
use crate::oauth::OAuthCredentials;

#[derive(Parser, Debug)]
#[command(name = "apib", about = "A command-line HTTP/1.1 load generator", version, disable_version_flag = true)]
pub struct Cli {
    #[arg(short = 'c', long = "concurrency", default_value_t = 1)]
    pub concurrency: usize,

    #[arg(short = 'K', long = "iothreads")]
    pub iothreads: Option<usize>,

    #[arg(short = 'd', long = "duration", default_value_t = 60)]
    pub duration: u64,

    #[arg(short = 'w', long = "warmup", default_value_t = 0)]
    pub warmup: u64,

    #[arg(short = 'W', long = "think-time", default_value_t = 0)]
    pub think_time_ms: u64,

    #[arg(short = 'k', long = "keep-alive", default_value_t = 1)]
    pub keep_alive: i32,

    #[arg(short = '1', long = "one")]
    pub one: bool,

    #[arg(short = 'x', long = "method")]
    pub method: Option<String>,

    #[arg(short = 'f', long = "input-file")]
    pub input_file: Option<PathBuf>,

    #[arg(short = 't', long = "content-type")]
    pub content_type: Option<String>,

    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    #[arg(short = 'u', long = "username-password")]
    pub username_password: Option<String>,

    #[arg(short = 'O', long = "oauth")]
    pub oauth: Option<String>,

    #[cfg(feature = "tls")]
    #[arg(short = 'C', long = "cipherlist")]
    pub cipherlist: Option<String>,

    #[cfg(feature = "tls")]
    #[arg(short = 'F', long = "certificate")]
    pub certificate: Option<PathBuf>,

    #[cfg(feature = "tls")]
    #[arg(short = 'V', long = "verify")]
    pub verify: bool,

    #[arg(short = 'N', long = "name", default_value = "apib")]
    pub name: String,

    #[arg(short = 'S', long = "csv-output")]
    pub csv_output: bool,

    #[arg(short = 'T', long = "header-line")]
    pub header_line: bool,

    #[arg(short = 'M', long = "monitor")]
    pub monitor: Option<String>,

    #[arg(short = 'X', long = "monitor2")]
    pub monitor2: Option<String>,

    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// A target URL, or `@path` naming a newline-separated URL file.
    pub target: Option<String>,
}

pub enum UrlSource {
    Literal(String),
    File(PathBuf),
}

impl Cli {
    pub fn url_source(&self) -> Result<UrlSource, ApibError> {
        let target = self
            .target
            .as_deref()
            .ok_or_else(|| ApibError::ConfigError("missing URL (or @path) argument".into()))?;
        match target.strip_prefix('@') {
            Some(path) => Ok(UrlSource::File(PathBuf::from(path))),
            None => Ok(UrlSource::Literal(target.to_string())),
        }
    }

    /// Mirrors `apib_main.c`'s post-parse validation: `-x`/`-f` default
    /// interplay, Basic-auth header synthesis, OAuth string splitting.
    pub fn into_run_config(self) -> Result<RunConfig, ApibError> {
        let body = match &self.input_file {
            Some(path) => Some(
                std::fs::read(path)
                    .map_err(|e| ApibError::InputFileError(format!("reading {}: {e}", path.display())))?,
            ),
            None => None,
        };

        let method = self
            .method
            .clone()
            .unwrap_or_else(|| if body.is_some() { "POST".to_string() } else { "GET".to_string() });

        let mut header_lines = self.headers.clone();
        if let Some(up) = &self.username_password {
            let encoded = BASE64.encode(up.as_bytes());
            header_lines.push(format!("Authorization: Basic {encoded}"));
        }

        let oauth = match &self.oauth {
            Some(spec) => Some(parse_oauth(spec)?),
            None => None,
        };

        let preset = PresetHeaders::from_header_lines(&header_lines);
        if oauth.is_some() && preset.authorization {
            return Err(ApibError::ConfigError(
                "cannot combine -O/--oauth with an explicit Authorization header".into(),
            ));
        }

        let io_threads = self
            .iothreads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        if io_threads == 0 {
            return Err(ApibError::ConfigError("--iothreads must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ApibError::ConfigError("--concurrency must be at least 1".into()));
        }

        Ok(RunConfig {
            concurrency: self.concurrency,
            io_threads,
            duration: Duration::from_secs(self.duration),
            warmup: Duration::from_secs(self.warmup),
            think_time: Duration::from_millis(self.think_time_ms),
            keep_alive: self.keep_alive != 0,
            one_shot: self.one,
            method,
            body,
            content_type: self.content_type.clone(),
            header_lines,
            oauth,
            #[cfg(feature = "tls")]
            tls_verify: self.verify,
            #[cfg(feature = "tls")]
            tls_cipher_list: self.cipherlist.clone(),
            #[cfg(feature = "tls")]
            tls_ca_bundle: self.certificate.clone(),
            run_name: self.name.clone(),
            csv_output: self.csv_output,
            monitor: self.monitor.clone(),
            monitor2: self.monitor2.clone(),
            verbose: self.verbose,
        })
    }
}

/// `"ck:cs[:at:as]"` -> consumer key/secret and optional access token/secret.
fn parse_oauth(spec: &str) -> Result<OAuthCredentials, ApibError> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.as_slice() {
        [ck, cs] => Ok(OAuthCredentials {
            consumer_key: ck.to_string(),
            consumer_secret: cs.to_string(),
            token: None,
            token_secret: None,
        }),
        [ck, cs, at, as_] => Ok(OAuthCredentials {
            consumer_key: ck.to_string(),
            consumer_secret: cs.to_string(),
            token: Some(at.to_string()),
            token_secret: Some(as_.to_string()),
        }),
        _ => Err(ApibError::ConfigError(format!(
            "malformed -O/--oauth value {spec:?}, expected \"key:secret\" or \"key:secret:token:tokensecret\""
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_defaults_to_post_when_body_present() {
        let cli = Cli::parse_from(["apib", "-f", "/dev/null", "http://example.com/"]);
        let cfg = cli.into_run_config().unwrap();
        assert_eq!(cfg.method, "POST");
    }

    #[test]
    fn method_defaults_to_get_without_body() {
        let cli = Cli::parse_from(["apib", "http://example.com/"]);
        let cfg = cli.into_run_config().unwrap();
        assert_eq!(cfg.method, "GET");
    }

    #[test]
    fn at_path_target_is_file_source() {
        let cli = Cli::parse_from(["apib", "@urls.txt"]);
        assert!(matches!(cli.url_source().unwrap(), UrlSource::File(_)));
    }

    #[test]
    fn oauth_short_form_parses() {
        let creds = parse_oauth("key:secret").unwrap();
        assert_eq!(creds.consumer_key, "key");
        assert!(creds.token.is_none());
    }

    #[test]
    fn oauth_long_form_parses() {
        let creds = parse_oauth("key:secret:token:tokensecret").unwrap();
        assert_eq!(creds.token.as_deref(), Some("token"));
    }

    #[test]
    fn oauth_malformed_errors() {
        assert!(parse_oauth("just-a-key").is_err());
    }
}
