//! Readiness-based reactor backend for a worker's event loop (spec section
//! 4.6), grounded on the epoll/kqueue primitives of
//! `examples/warpy-ai-script/src/runtime/async/reactor.rs`, rewritten to
//! register/re-register interest per readiness event and hand back plain
//! `(Token, Interest)` pairs to a direct state-machine dispatcher instead of
//! waking `std::task::Waker`s for a futures executor.

use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Identifies a registered fd; here simply the fd itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub RawFd);

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use libc::{
        epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
        EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    };
    use std::io;

    pub struct Backend {
        epoll_fd: RawFd,
    }

    fn events_for(interest: Interest) -> u32 {
        match interest {
            Interest::Readable => (EPOLLIN | EPOLLERR | EPOLLHUP) as u32,
            Interest::Writable => (EPOLLOUT | EPOLLERR | EPOLLHUP) as u32,
        }
    }

    impl Backend {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Backend { epoll_fd: fd })
        }

        pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.ctl(EPOLL_CTL_ADD, fd, interest)
        }

        pub fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.ctl(EPOLL_CTL_MOD, fd, interest)
        }

        pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
            let mut event: epoll_event = unsafe { std::mem::zeroed() };
            if unsafe { epoll_ctl(self.epoll_fd, EPOLL_CTL_DEL, fd, &mut event) } < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOENT) {
                    return Ok(());
                }
                return Err(err);
            }
            Ok(())
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
            let mut event = epoll_event {
                events: events_for(interest),
                u64: fd as u64,
            };
            if unsafe { epoll_ctl(self.epoll_fd, op, fd, &mut event) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(Token, Interest)>> {
            const MAX_EVENTS: usize = 1024;
            let mut events: Vec<epoll_event> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
            let n = unsafe {
                epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
            let mut ready = Vec::with_capacity(n as usize);
            for ev in events.iter().take(n as usize) {
                let fd = ev.u64 as RawFd;
                let interest = if ev.events as i32 & EPOLLOUT != 0 {
                    Interest::Writable
                } else {
                    Interest::Readable
                };
                ready.push((Token(fd), interest));
            }
            Ok(ready)
        }
    }

    impl Drop for Backend {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.epoll_fd);
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::*;
    use libc::{kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ONESHOT};
    use std::io;

    pub struct Backend {
        kq_fd: RawFd,
    }

    fn filter_for(interest: Interest) -> i16 {
        match interest {
            Interest::Readable => EVFILT_READ as i16,
            Interest::Writable => EVFILT_WRITE as i16,
        }
    }

    impl Backend {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { kqueue() };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Backend { kq_fd: fd })
        }

        fn change(&self, fd: RawFd, interest: Interest, flags: u16) -> io::Result<()> {
            let event = libc::kevent {
                ident: fd as usize,
                filter: filter_for(interest),
                flags,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            if unsafe { kevent(self.kq_fd, &event, 1, std::ptr::null_mut(), 0, std::ptr::null()) } < 0
            {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.change(fd, interest, EV_ADD | EV_ONESHOT)
        }

        pub fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
            self.change(fd, interest, EV_ADD | EV_ONESHOT)
        }

        pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
            let _ = self.change(fd, Interest::Readable, EV_DELETE);
            let _ = self.change(fd, Interest::Writable, EV_DELETE);
            Ok(())
        }

        pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(Token, Interest)>> {
            const MAX_EVENTS: usize = 1024;
            let mut events: Vec<libc::kevent> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as i64,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as i64,
            };
            let ts_ptr = if timeout_ms < 0 { std::ptr::null() } else { &ts as *const timespec };
            let n = unsafe {
                kevent(
                    self.kq_fd,
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    ts_ptr,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
            let mut ready = Vec::with_capacity(n as usize);
            for ev in events.iter().take(n as usize) {
                let fd = ev.ident as RawFd;
                let interest = if ev.filter == EVFILT_READ as i16 {
                    Interest::Readable
                } else {
                    Interest::Writable
                };
                ready.push((Token(fd), interest));
            }
            Ok(ready)
        }
    }

    impl Drop for Backend {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.kq_fd);
            }
        }
    }
}

pub use sys::Backend;
