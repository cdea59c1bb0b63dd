//! I/O Reactor Glue (spec §4.9/C9): watches child stdout/stderr for
//! readability and HUP so the Lifecycle Controller can drain logs and
//! detect exit. Grounded verbatim on `EpollContext` in
//! `vmm/src/lib.rs` — same `epoll` crate version, same
//! create/ctl/wait/dispatch-table shape, retargeted from virtio queue fds
//! to per-VM stdout/stderr/child-exit fds.

use std::os::unix::io::RawFd;

use crate::error::{InternalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Stdout(u32),
    Stderr(u32),
    EventTimer,
    MetricsTimer,
}

pub struct Reactor {
    epoll_raw_fd: RawFd,
    dispatch_table: Vec<Option<Dispatch>>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let epoll_raw_fd = epoll::create(true).map_err(InternalError::Epoll)?;
        Ok(Reactor {
            epoll_raw_fd,
            dispatch_table: Vec::with_capacity(32),
        })
    }

    /// Registers `fd` for readability and returns the dispatch-table index
    /// to pass to `unwatch` later.
    pub fn watch(&mut self, fd: RawFd, token: Dispatch) -> Result<u64> {
        let index = self.dispatch_table.len() as u64;
        epoll::ctl(
            self.epoll_raw_fd,
            epoll::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(epoll::EPOLLIN, index),
        )
        .map_err(InternalError::Epoll)?;
        self.dispatch_table.push(Some(token));
        Ok(index)
    }

    pub fn unwatch(&mut self, fd: RawFd, index: u64) {
        let _ = epoll::ctl(
            self.epoll_raw_fd,
            epoll::EPOLL_CTL_DEL,
            fd,
            epoll::Event::new(epoll::EPOLLIN, index),
        );
        if let Some(slot) = self.dispatch_table.get_mut(index as usize) {
            *slot = None;
        }
    }

    /// Blocks up to `timeout_ms` (-1 = forever) and returns the tokens
    /// ready for dispatch, in event order.
    pub fn wait(&self, timeout_ms: i32) -> Result<Vec<Dispatch>> {
        let mut events = Vec::<epoll::Event>::with_capacity(32);
        unsafe { events.set_len(32) };
        let n = epoll::wait(self.epoll_raw_fd, timeout_ms, &mut events[..])
            .map_err(InternalError::Poll)?;
        Ok(events[..n]
            .iter()
            .filter_map(|e| self.dispatch_table.get(e.data() as usize).copied().flatten())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_watch_and_wait_on_pipe() {
        let (r, w) = nix_pipe();
        let mut reactor = Reactor::new().unwrap();
        reactor.watch(r.as_raw_fd(), Dispatch::Stdout(7)).unwrap();
        unsafe {
            libc::write(w.as_raw_fd(), b"x".as_ptr() as *const _, 1);
        }
        let ready = reactor.wait(1000).unwrap();
        assert_eq!(ready, vec![Dispatch::Stdout(7)]);
    }

    struct Fd(RawFd);
    impl AsRawFd for Fd {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }
    impl Drop for Fd {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.0);
            }
        }
    }

    fn nix_pipe() -> (Fd, Fd) {
        let mut fds = [0i32; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        (Fd(fds[0]), Fd(fds[1]))
    }
}
