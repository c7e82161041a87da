//! epoll readiness polling and the eventfd used by workers to wake the
//! reactor thread.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::{Interest, Token};

mod sys {
    use libc::{
        EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, epoll_event,
    };
    use std::io;
    use std::os::unix::io::RawFd;

    use super::super::Interest;

    pub fn create_epoll() -> io::Result<RawFd> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    fn mask(interest: Interest) -> u32 {
        let bits = match interest {
            Interest::Readable => EPOLLIN | EPOLLERR | EPOLLHUP,
            Interest::Writable => EPOLLOUT | EPOLLERR | EPOLLHUP,
        };
        bits as u32
    }

    pub fn ctl(epoll_fd: RawFd, op: i32, fd: RawFd, data: u64, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: mask(interest),
            u64: data,
        };
        let event_ptr = if op == EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut epoll_event
        };
        if unsafe { libc::epoll_ctl(epoll_fd, op, fd, event_ptr) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub const ADD: i32 = EPOLL_CTL_ADD;
    pub const MOD: i32 = EPOLL_CTL_MOD;
    pub const DEL: i32 = EPOLL_CTL_DEL;

    pub fn wait(epoll_fd: RawFd, events: &mut [epoll_event], timeout: i32) -> io::Result<usize> {
        let n = unsafe { libc::epoll_wait(epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn is_readable(events: u32) -> bool {
        events & (EPOLLIN | EPOLLERR | EPOLLHUP) as u32 != 0
    }
}

/// Level-triggered epoll instance.
pub struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll_fd = sys::create_epoll()?;
        Ok(Self {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        sys::ctl(self.epoll_fd, sys::ADD, fd, token.0 as u64, interest)
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        sys::ctl(self.epoll_fd, sys::MOD, fd, token.0 as u64, interest)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        sys::ctl(self.epoll_fd, sys::DEL, fd, 0, Interest::Readable)
    }

    /// Block until at least one registered fd is ready or `timeout` elapses.
    /// `None` waits indefinitely. An interrupted wait reports no events.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Interest)>> {
        let timeout_ms = match timeout {
            None => -1,
            // round up so a pending deadline is never polled early
            Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
        };

        let n = match sys::wait(self.epoll_fd, &mut self.events, timeout_ms) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        let mut ready = Vec::with_capacity(n);
        for event in &self.events[..n] {
            let (bits, data) = (event.events, event.u64);
            let interest = if sys::is_readable(bits) {
                Interest::Readable
            } else {
                Interest::Writable
            };
            ready.push((Token(data as usize), interest));
        }
        Ok(ready)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// Cross-thread wake-up backed by a non-blocking eventfd. Shared with the
/// worker threads through an `Arc`.
pub struct Notifier {
    fd: RawFd,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Signal the reactor. Signals coalesce until the next `drain`.
    pub fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.fd, (&one as *const u64).cast(), 8) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // counter saturated; the reactor is already signalled
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Reset the signal. A drain with nothing pending is not an error.
    pub fn drain(&self) -> io::Result<()> {
        let mut value: u64 = 0;
        let n = unsafe { libc::read(self.fd, (&mut value as *mut u64).cast(), 8) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_notifier_wakes_poller() {
        let mut poller = Poller::new(8).unwrap();
        let notifier = Notifier::new().unwrap();
        poller
            .register(notifier.as_raw_fd(), Token(0), Interest::Readable)
            .unwrap();

        assert!(poller.wait(Some(Duration::ZERO)).unwrap().is_empty());
        notifier.notify().unwrap();
        notifier.notify().unwrap();
        assert_eq!(
            poller.wait(Some(Duration::from_secs(1))).unwrap(),
            vec![(Token(0), Interest::Readable)]
        );

        // level-triggered: still ready until drained
        assert_eq!(poller.wait(Some(Duration::ZERO)).unwrap().len(), 1);
        notifier.drain().unwrap();
        assert!(poller.wait(Some(Duration::ZERO)).unwrap().is_empty());
        notifier.drain().unwrap();
    }

    #[test]
    fn test_deregistered_fd_is_silent() {
        let mut poller = Poller::new(8).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        poller.register(b.as_raw_fd(), Token(7), Interest::Readable).unwrap();
        a.write_all(b"x").unwrap();
        assert_eq!(
            poller.wait(Some(Duration::from_secs(1))).unwrap(),
            vec![(Token(7), Interest::Readable)]
        );

        poller.deregister(b.as_raw_fd()).unwrap();
        assert!(poller.wait(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn test_writable_interest() {
        let mut poller = Poller::new(8).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        poller.register(a.as_raw_fd(), Token(3), Interest::Readable).unwrap();
        assert!(poller.wait(Some(Duration::ZERO)).unwrap().is_empty());
        poller.reregister(a.as_raw_fd(), Token(3), Interest::Writable).unwrap();
        assert_eq!(
            poller.wait(Some(Duration::ZERO)).unwrap(),
            vec![(Token(3), Interest::Writable)]
        );
    }
}
