// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness-driven I/O on raw, non-blocking file descriptors.
//!
//! A task that would block registers itself as a waiter on the fd and
//! parks; the poller's event wakes it and the operation retries. Any
//! number of tasks may wait on the same fd, each with its own interest.
//! A waiter stays in the runtime's fd table between waits and leaves it
//! once the operation completes or the future is dropped; the fd leaves
//! the poller with its last waiter.
//!
//! Outside a runtime the futures fall back to re-polling, which works
//! with `park::block_on`'s backoff.

use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::context;
use crate::poller::{Interest, Readiness};
use crate::sched::runtime::{IoKey, Shared};
use crate::sched::task::IoWait;

/// Non-blocking readiness check.
fn poll_now(fd: RawFd, interest: Interest) -> io::Result<Readiness> {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::empty());
        }
        return Err(err);
    }
    let mut r = Readiness::empty();
    if pfd.revents & libc::POLLIN != 0 {
        r |= Readiness::READABLE;
    }
    if pfd.revents & libc::POLLOUT != 0 {
        r |= Readiness::WRITABLE;
    }
    if pfd.revents & libc::POLLERR != 0 {
        r |= Readiness::ERROR;
    }
    if pfd.revents & libc::POLLHUP != 0 {
        r |= Readiness::HANGUP;
    }
    if pfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(r)
}

/// Future returned by [`readable`], [`writable`] and [`ready`].
pub struct ReadyFuture {
    fd: RawFd,
    interest: Interest,
    watched: Option<Arc<Shared>>,
    key: Option<IoKey>,
}

/// Wait until `fd` is readable (or hung up / in error).
pub fn readable(fd: RawFd) -> ReadyFuture {
    ready(fd, Interest::Readable)
}

/// Wait until `fd` is writable (or hung up / in error).
pub fn writable(fd: RawFd) -> ReadyFuture {
    ready(fd, Interest::Writable)
}

pub fn ready(fd: RawFd, interest: Interest) -> ReadyFuture {
    ReadyFuture {
        fd,
        interest,
        watched: None,
        key: None,
    }
}

impl ReadyFuture {
    fn unwatch(&mut self) -> bool {
        match (self.watched.take(), self.key.take()) {
            (Some(shared), Some(key)) => {
                shared.unwatch_fd(self.fd, key);
                true
            }
            _ => false,
        }
    }

    fn release(&mut self) {
        if self.unwatch() {
            if let Some(task) = context::current_task() {
                task.set_io_wait(None);
            }
        }
    }
}

impl Future for ReadyFuture {
    type Output = io::Result<Readiness>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let readiness = match poll_now(self.fd, self.interest) {
            Ok(r) => r,
            Err(e) => {
                self.release();
                return Poll::Ready(Err(e));
            }
        };
        if !readiness.is_empty() {
            self.release();
            return Poll::Ready(Ok(readiness));
        }

        let Some(shared) = context::current_shared() else {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        };
        let this = &mut *self;
        if let Err(e) = shared.watch_fd(this.fd, this.interest, cx.waker(), &mut this.key) {
            this.release();
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
        }
        if let Some(task) = context::current_task() {
            task.set_io_wait(Some(IoWait {
                fd: self.fd,
                interest: self.interest,
            }));
        }
        self.watched = Some(shared);
        Poll::Pending
    }
}

impl Drop for ReadyFuture {
    fn drop(&mut self) {
        self.unwatch();
    }
}

/// Read into `buf`, parking the task while the fd has no data.
pub async fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => {
                readable(fd).await?;
            }
            io::ErrorKind::Interrupted => {}
            _ => return Err(err),
        }
    }
}

/// Write from `buf`, parking the task while the fd is full.
pub async fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => {
                writable(fd).await?;
            }
            io::ErrorKind::Interrupted => {}
            _ => return Err(err),
        }
    }
}

/// Write all of `buf`.
pub async fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf).await? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}
