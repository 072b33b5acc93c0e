//! File-descriptor soft-limit raising (spec section 5: "raises the
//! file-descriptor soft limit to the hard limit when the requested
//! connection count would exceed the soft limit"), grounded on
//! `examples/original_source/apib_main.c`'s startup `setrlimit` call.

use crate::error::ApibError;

/// Reserve a few fds per connection for the socket plus whatever else the
/// process already has open (stdio, monitor connections).
const FD_HEADROOM: u64 = 64;

pub fn raise_if_needed(concurrency: usize) -> Result<(), ApibError> {
    let needed = concurrency as u64 + FD_HEADROOM;

    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(ApibError::RlimitFailure(format!(
            "getrlimit(RLIMIT_NOFILE) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    if limit.rlim_cur >= needed {
        return Ok(());
    }

    let new_soft = needed.min(limit.rlim_max);
    if new_soft < needed {
        return Err(ApibError::RlimitFailure(format!(
            "need {needed} file descriptors for {concurrency} connections but the hard limit is {}",
            limit.rlim_max
        )));
    }

    let new_limit = libc::rlimit {
        rlim_cur: new_soft,
        rlim_max: limit.rlim_max,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &new_limit) } != 0 {
        return Err(ApibError::RlimitFailure(format!(
            "setrlimit(RLIMIT_NOFILE) to {new_soft} failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    tracing::info!(from = limit.rlim_cur, to = new_soft, "raised file descriptor limit");
    Ok(())
}
