//! Platform readiness multiplexer (epoll on Linux, kqueue on macOS).
//!
//! Every non-blocking socket operation that would block registers its
//! waker here for the interest it needs (readable or writable) and returns
//! `Poll::Pending`; `ReactorHandle::turn` blocks in the OS poll call until
//! at least one fd is ready (or the next timer deadline, whichever is
//! sooner) and wakes exactly the wakers registered for the fds that fired.
//! One registration per fd per interest is live at a time, matching the
//! spec's "registers exactly one reader or writer per file descriptor at a
//! time" requirement — a fresh `register` call for the same fd replaces
//! the previous waker rather than stacking one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::task::Waker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

struct Waiters {
    read: Option<Waker>,
    write: Option<Waker>,
}

pub struct ReactorHandle {
    poll_fd: RawFd,
    waiters: RefCell<HashMap<RawFd, Waiters>>,
}

impl ReactorHandle {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll_fd: sys::create()?,
            waiters: RefCell::new(HashMap::new()),
        })
    }

    /// Register interest in `fd` becoming ready for `interest`, waking
    /// `waker` the next time `turn` observes it. Replaces any waker
    /// previously registered for the same fd and interest.
    pub fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> io::Result<()> {
        let mut waiters = self.waiters.borrow_mut();
        let entry = waiters.entry(fd).or_insert(Waiters {
            read: None,
            write: None,
        });
        let had_any = entry.read.is_some() || entry.write.is_some();
        match interest {
            Interest::Readable => entry.read = Some(waker),
            Interest::Writable => entry.write = Some(waker),
        }
        let combined = combined_interest(entry);
        drop(waiters);

        if had_any {
            sys::modify(self.poll_fd, fd, combined)
        } else {
            sys::add(self.poll_fd, fd, combined)
        }
    }

    /// Drop all pending registrations for `fd` (called when the socket is
    /// closed or the future driving it is cancelled).
    pub fn deregister(&self, fd: RawFd) {
        self.waiters.borrow_mut().remove(&fd);
        let _ = sys::remove(self.poll_fd, fd);
    }

    /// Block until at least one registered fd is ready or `timeout_ms`
    /// elapses (`-1` blocks indefinitely, `0` polls without blocking), then
    /// wake every waker whose interest fired.
    pub fn turn(&self, timeout_ms: i32) -> io::Result<()> {
        let ready = sys::wait(self.poll_fd, timeout_ms)?;
        let mut waiters = self.waiters.borrow_mut();
        for (fd, readable, writable) in ready {
            if let Some(entry) = waiters.get_mut(&fd) {
                if readable {
                    if let Some(waker) = entry.read.take() {
                        waker.wake();
                    }
                }
                if writable {
                    if let Some(waker) = entry.write.take() {
                        waker.wake();
                    }
                }
                if entry.read.is_none() && entry.write.is_none() {
                    waiters.remove(&fd);
                    drop(waiters);
                    let _ = sys::remove(self.poll_fd, fd);
                    waiters = self.waiters.borrow_mut();
                }
            }
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.waiters.borrow().is_empty()
    }
}

fn combined_interest(w: &Waiters) -> (bool, bool) {
    (w.read.is_some(), w.write.is_some())
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.poll_fd);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<ReactorHandle>>> = const { RefCell::new(None) };
}

/// Installs `reactor` as the thread's current reactor for the duration of
/// `f`. Runtimes are not nested on the same thread.
pub fn enter<R>(reactor: Rc<ReactorHandle>, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT.with(|cell| cell.borrow_mut().replace(reactor));
    let result = f();
    CURRENT.with(|cell| *cell.borrow_mut() = previous);
    result
}

/// Returns the reactor installed by the innermost [`enter`] call on this
/// thread.
///
/// # Panics
/// Panics if called outside of `Runtime::block_on` — matches the "no
/// reactor running" panics other async runtimes raise for the same misuse.
pub fn current() -> Rc<ReactorHandle> {
    CURRENT.with(|cell| {
        cell.borrow()
            .clone()
            .expect("no httpflow runtime is running on this thread")
    })
}

#[cfg(target_os = "linux")]
mod sys {
    use super::RawFd;
    use libc::{
        epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
        EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    };
    use std::io;

    fn events_for(readable: bool, writable: bool) -> u32 {
        let mut events = EPOLLERR as u32 | EPOLLHUP as u32;
        if readable {
            events |= EPOLLIN as u32;
        }
        if writable {
            events |= EPOLLOUT as u32;
        }
        events
    }

    pub fn create() -> io::Result<RawFd> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    fn ctl(epoll_fd: RawFd, op: i32, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        let mut event = epoll_event {
            events: events_for(readable, writable),
            u64: fd as u64,
        };
        let rc = unsafe { epoll_ctl(epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn add(epoll_fd: RawFd, fd: RawFd, (readable, writable): (bool, bool)) -> io::Result<()> {
        ctl(epoll_fd, EPOLL_CTL_ADD, fd, readable, writable)
    }

    pub fn modify(epoll_fd: RawFd, fd: RawFd, (readable, writable): (bool, bool)) -> io::Result<()> {
        ctl(epoll_fd, EPOLL_CTL_MOD, fd, readable, writable)
    }

    pub fn remove(epoll_fd: RawFd, fd: RawFd) -> io::Result<()> {
        unsafe {
            if epoll_ctl(epoll_fd, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    pub fn wait(epoll_fd: RawFd, timeout_ms: i32) -> io::Result<Vec<(RawFd, bool, bool)>> {
        const MAX_EVENTS: usize = 1024;
        let mut events: Vec<epoll_event> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
        let n = unsafe { epoll_wait(epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut ready = Vec::with_capacity(n as usize);
        for event in events.iter().take(n as usize) {
            let fd = event.u64 as RawFd;
            let mask = event.events as i32;
            let readable = mask & (EPOLLIN | EPOLLERR | EPOLLHUP) != 0;
            let writable = mask & (EPOLLOUT | EPOLLERR | EPOLLHUP) != 0;
            ready.push((fd, readable, writable));
        }
        Ok(ready)
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::RawFd;
    use libc::{
        kevent, kqueue, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE,
    };
    use std::io;

    pub fn create() -> io::Result<RawFd> {
        let fd = unsafe { kqueue() };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
        libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }
    }

    fn apply(kq: RawFd, changes: &[libc::kevent]) -> io::Result<()> {
        let rc = unsafe {
            kevent(
                kq,
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn add(kq: RawFd, fd: RawFd, (readable, writable): (bool, bool)) -> io::Result<()> {
        let mut changes = Vec::new();
        changes.push(change(
            fd,
            EVFILT_READ,
            if readable { EV_ADD | EV_ENABLE } else { EV_DELETE },
        ));
        changes.push(change(
            fd,
            EVFILT_WRITE,
            if writable { EV_ADD | EV_ENABLE } else { EV_DELETE },
        ));
        // Deleting a filter that was never added is harmless to ignore.
        for c in changes {
            let _ = apply(kq, &[c]);
        }
        Ok(())
    }

    pub fn modify(kq: RawFd, fd: RawFd, interest: (bool, bool)) -> io::Result<()> {
        add(kq, fd, interest)
    }

    pub fn remove(kq: RawFd, fd: RawFd) -> io::Result<()> {
        for filter in [EVFILT_READ, EVFILT_WRITE] {
            let c = change(fd, filter, EV_DELETE);
            let _ = apply(kq, &[c]);
        }
        Ok(())
    }

    pub fn wait(kq: RawFd, timeout_ms: i32) -> io::Result<Vec<(RawFd, bool, bool)>> {
        const MAX_EVENTS: usize = 1024;
        let mut events = vec![unsafe { std::mem::zeroed::<libc::kevent>() }; MAX_EVENTS];
        let ts = if timeout_ms < 0 {
            None
        } else {
            Some(libc::timespec {
                tv_sec: (timeout_ms / 1000) as i64,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as i64,
            })
        };
        let ts_ptr = ts
            .as_ref()
            .map(|t| t as *const libc::timespec)
            .unwrap_or(std::ptr::null());

        let n = unsafe {
            kevent(
                kq,
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
        for event in events.iter().take(n as usize) {
            let fd = event.ident as RawFd;
            let readable = event.filter == EVFILT_READ;
            let writable = event.filter == EVFILT_WRITE;
            ready.push((fd, readable, writable));
        }
        Ok(ready)
    }
}
