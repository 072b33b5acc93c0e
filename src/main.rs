//! Binary entry point, grounded on `examples/original_source/apib_main.c`'s
//! `main` (argument parsing, URL registry bootstrap, run, report).

use clap::Parser;

use apib::cli::{Cli, UrlSource};
use apib::driver::Driver;
use apib::error::{exit_code, ApibError};
use apib::reporting;
use apib::url::UrlRegistry;

fn main() {
    let cli = Cli::parse();

    if cli.header_line {
        println!("{}", reporting::csv_header());
        return;
    }

    let filter = if cli.verbose { "apib=debug" } else { "apib=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .init();

    let url_source = match cli.url_source() {
        Ok(src) => src,
        Err(e) => fail(&e),
    };

    match &url_source {
        UrlSource::Literal(raw) => {
            if let Err(e) = UrlRegistry::init_single(raw) {
                fail(&e)
            }
        }
        UrlSource::File(path) => {
            if let Err(e) = UrlRegistry::init_file(path) {
                fail(&e)
            }
        }
    }

    let config = match cli.into_run_config() {
        Ok(c) => c,
        Err(e) => fail(&e),
    };
    let csv_output = config.csv_output;

    let report = match Driver::new(config).run() {
        Ok(r) => r,
        Err(e) => fail(&e),
    };

    if csv_output {
        println!("{}", reporting::format_csv(&report));
    } else {
        print!("{}", reporting::format_human(&report));
    }
}

/// Maps a startup/runtime error to its exit code (spec section 6) and exits.
/// Bad arguments and invalid configuration are usage errors; unreadable
/// input files and file-descriptor limit failures get their own code rather
/// than collapsing into the generic setup-failure bucket, matching
/// `examples/original_source/apib_main.cc`'s distinct `initializeThread`
/// failure path.
fn fail(e: &ApibError) -> ! {
    eprintln!("apib: {e}");
    std::process::exit(exit_code_for(e));
}

fn exit_code_for(e: &ApibError) -> i32 {
    match e {
        ApibError::InvalidUrl(_) | ApibError::DnsFailure { .. } | ApibError::ConfigError(_) => {
            exit_code::USAGE_ERROR
        }
        ApibError::InputFileError(_) | ApibError::RlimitFailure(_) => exit_code::RLIMIT_FAILURE,
        ApibError::SocketError(_) | ApibError::TlsError(_) | ApibError::HttpParseError(_) | ApibError::Fatal(_) => {
            exit_code::SETUP_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_rlimit_errors_map_to_rlimit_failure_code() {
        assert_eq!(exit_code_for(&ApibError::InputFileError("x".into())), exit_code::RLIMIT_FAILURE);
        assert_eq!(exit_code_for(&ApibError::RlimitFailure("x".into())), exit_code::RLIMIT_FAILURE);
    }

    #[test]
    fn bad_arguments_map_to_usage_error_code() {
        assert_eq!(exit_code_for(&ApibError::ConfigError("x".into())), exit_code::USAGE_ERROR);
        assert_eq!(exit_code_for(&ApibError::InvalidUrl("x".into())), exit_code::USAGE_ERROR);
    }

    #[test]
    fn runtime_io_errors_map_to_generic_setup_failure_code() {
        assert_eq!(
            exit_code_for(&ApibError::TlsError("x".into())),
            exit_code::SETUP_FAILURE
        );
    }
}
