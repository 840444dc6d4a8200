// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! epoll backend. An eventfd registered level-triggered under a reserved
//! token interrupts `epoll_wait`.

use std::io;
use std::os::unix::io::RawFd;

use super::{Interest, Readiness, MAX_EVENTS};

const WAKE_TOKEN: u64 = u64::MAX;

pub(super) struct Selector {
    epoll_fd: RawFd,
    wake_fd: RawFd,
}

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = (libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn readiness(bits: u32) -> Readiness {
    let mut r = Readiness::empty();
    if bits & libc::EPOLLIN as u32 != 0 {
        r |= Readiness::READABLE;
    }
    if bits & libc::EPOLLOUT as u32 != 0 {
        r |= Readiness::WRITABLE;
    }
    if bits & libc::EPOLLERR as u32 != 0 {
        r |= Readiness::ERROR;
    }
    if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
        r |= Readiness::HANGUP;
    }
    r
}

impl Selector {
    pub(super) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self { epoll_fd, wake_fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(interest),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub(super) fn modify(&self, fd: RawFd, _old: Interest, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub(super) fn delete(&self, fd: RawFd, _interest: Interest) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Already closed by the owner.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Returns true if the wait was cut short by `notify`.
    pub(super) fn select(
        &self,
        out: &mut Vec<(RawFd, Readiness)>,
        timeout_ms: i32,
    ) -> io::Result<bool> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(err);
        }

        let mut notified = false;
        for ev in &events[..n as usize] {
            let token = ev.u64;
            let bits = ev.events;
            if token == WAKE_TOKEN {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                notified = true;
                continue;
            }
            out.push((token as RawFd, readiness(bits)));
        }
        Ok(notified)
    }

    pub(super) fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8)
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
