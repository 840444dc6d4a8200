// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! kqueue backend. Read and write interest are separate one-shot
//! filters; an `EVFILT_USER` event interrupts `kevent`.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

use super::{Interest, Readiness, MAX_EVENTS};

const WAKE_IDENT: usize = usize::MAX;

pub(super) struct Selector {
    kq: RawFd,
}

fn kev(ident: usize, filter: i16, flags: u16, fflags: u32) -> libc::kevent {
    // SAFETY: kevent is plain old data; all-zero is a valid value.
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev
}

fn filters(interest: Interest) -> impl Iterator<Item = i16> {
    let read = interest.is_readable().then_some(libc::EVFILT_READ as i16);
    let write = interest.is_writable().then_some(libc::EVFILT_WRITE as i16);
    read.into_iter().chain(write)
}

impl Selector {
    pub(super) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let selector = Self { kq };
        selector.apply(&[kev(
            WAKE_IDENT,
            libc::EVFILT_USER as i16,
            (libc::EV_ADD | libc::EV_CLEAR) as u16,
            0,
        )])?;
        Ok(selector)
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as _,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn apply_each(&self, fd: RawFd, interest: Interest, flags: u16, tolerate_missing: bool) -> io::Result<()> {
        for filter in filters(interest) {
            if let Err(err) = self.apply(&[kev(fd as usize, filter, flags, 0)]) {
                let missing = matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF));
                if !(tolerate_missing && missing) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub(super) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.apply_each(fd, interest, (libc::EV_ADD | libc::EV_ONESHOT) as u16, false)
    }

    pub(super) fn modify(&self, fd: RawFd, old: Interest, interest: Interest) -> io::Result<()> {
        // Fired one-shot filters are already gone, so missing ones are fine.
        self.apply_each(fd, old, libc::EV_DELETE as u16, true)?;
        self.add(fd, interest)
    }

    pub(super) fn delete(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.apply_each(fd, interest, libc::EV_DELETE as u16, true)
    }

    /// Returns true if the wait was cut short by `notify`.
    pub(super) fn select(
        &self,
        out: &mut Vec<(RawFd, Readiness)>,
        timeout_ms: i32,
    ) -> io::Result<bool> {
        // SAFETY: see `kev`.
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { mem::zeroed() };
        let ts;
        let ts_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) as libc::c_long) * 1_000_000,
            };
            &ts as *const libc::timespec
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as _,
                ts_ptr,
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
            if ev.filter == libc::EVFILT_USER as _ {
                notified = true;
                continue;
            }
            let mut r = Readiness::empty();
            if ev.filter == libc::EVFILT_READ as _ {
                r |= Readiness::READABLE;
            }
            if ev.filter == libc::EVFILT_WRITE as _ {
                r |= Readiness::WRITABLE;
            }
            if ev.flags & (libc::EV_EOF as u16) != 0 {
                r |= Readiness::HANGUP;
            }
            if ev.flags & (libc::EV_ERROR as u16) != 0 {
                r |= Readiness::ERROR;
            }
            out.push((ev.ident as RawFd, r));
        }
        Ok(notified)
    }

    pub(super) fn notify(&self) -> io::Result<()> {
        self.apply(&[kev(
            WAKE_IDENT,
            libc::EVFILT_USER as i16,
            0,
            libc::NOTE_TRIGGER as u32,
        )])
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
