// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness multiplexer over epoll (Linux) and kqueue (BSD/macOS).
//!
//! Maps file descriptors to a caller-chosen target (the runtime stores
//! the parked task's `Waker`). Registrations are one-shot: once an event
//! is delivered the fd stays registered but is disarmed until `rearm`.
//!
//! `register`/`rearm`/`unregister` may be called from any thread while
//! another thread is blocked in `wait`. The registration map is never
//! locked across the blocking syscall.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;

use crate::error::PollError;
use crate::lock;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll as sys;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
use kqueue as sys;

/// Upper bound on events drained per `wait`.
pub(crate) const MAX_EVENTS: usize = 64;

/// I/O interest for registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::ReadWrite)
    }

    /// Smallest interest covering both.
    pub fn union(self, other: Interest) -> Interest {
        match (self.is_readable() || other.is_readable(), self.is_writable() || other.is_writable()) {
            (true, true) => Interest::ReadWrite,
            (true, false) => Interest::Readable,
            _ => Interest::Writable,
        }
    }

    /// Whether an event with `readiness` concerns a waiter with this
    /// interest. Errors and hangups concern everyone.
    pub fn is_satisfied_by(self, readiness: Readiness) -> bool {
        readiness.intersects(Readiness::ERROR | Readiness::HANGUP)
            || (self.is_readable() && readiness.contains(Readiness::READABLE))
            || (self.is_writable() && readiness.contains(Readiness::WRITABLE))
    }
}

bitflags! {
    /// What a delivered event reports about its fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Readiness: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HANGUP   = 0b1000;
    }
}

/// One ready fd.
#[derive(Debug, Clone)]
pub struct PollEvent<T> {
    pub fd: RawFd,
    pub readiness: Readiness,
    pub target: T,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub total_waits: u64,
    pub total_events: u64,
    pub total_timeouts: u64,
}

struct Registration<T> {
    interest: Interest,
    target: T,
}

pub struct Poller<T> {
    selector: sys::Selector,
    registrations: Mutex<HashMap<RawFd, Registration<T>>>,
    waits: AtomicU64,
    events: AtomicU64,
    timeouts: AtomicU64,
}

impl<T: Clone> Poller<T> {
    pub fn new() -> Result<Self, PollError> {
        Ok(Self {
            selector: sys::Selector::new()?,
            registrations: Mutex::new(HashMap::new()),
            waits: AtomicU64::new(0),
            events: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    /// Associate `fd` with `target`. An fd may be registered only once.
    pub fn register(&self, fd: RawFd, interest: Interest, target: T) -> Result<(), PollError> {
        let mut regs = lock(&self.registrations);
        if regs.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered(fd));
        }
        self.selector.add(fd, interest)?;
        regs.insert(fd, Registration { interest, target });
        Ok(())
    }

    /// Re-enable a registered fd, optionally with a new interest/target.
    pub fn rearm(&self, fd: RawFd, interest: Interest, target: T) -> Result<(), PollError> {
        let mut regs = lock(&self.registrations);
        let reg = regs.get_mut(&fd).ok_or(PollError::NotRegistered(fd))?;
        self.selector.modify(fd, reg.interest, interest)?;
        *reg = Registration { interest, target };
        Ok(())
    }

    /// Drop the association and return its target.
    pub fn unregister(&self, fd: RawFd) -> Result<T, PollError> {
        let reg = lock(&self.registrations)
            .remove(&fd)
            .ok_or(PollError::NotRegistered(fd))?;
        self.selector.delete(fd, reg.interest)?;
        Ok(reg.target)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        lock(&self.registrations).contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        lock(&self.registrations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block up to `timeout_ms` (negative: forever) for readiness.
    ///
    /// A timeout returns an empty vector and bumps `total_timeouts`. A
    /// `notify` also returns early, possibly empty, without counting as
    /// a timeout.
    pub fn wait(&self, timeout_ms: i32) -> Result<Vec<PollEvent<T>>, PollError> {
        self.waits.fetch_add(1, Ordering::Relaxed);

        let mut raw: Vec<(RawFd, Readiness)> = Vec::with_capacity(MAX_EVENTS);
        let notified = self.selector.select(&mut raw, timeout_ms)?;

        // kqueue reports read and write separately; fold per fd.
        let mut merged: Vec<(RawFd, Readiness)> = Vec::with_capacity(raw.len());
        for (fd, readiness) in raw {
            match merged.iter_mut().find(|(f, _)| *f == fd) {
                Some((_, r)) => *r |= readiness,
                None => merged.push((fd, readiness)),
            }
        }

        let events: Vec<PollEvent<T>> = {
            let regs = lock(&self.registrations);
            merged
                .into_iter()
                .filter_map(|(fd, readiness)| {
                    regs.get(&fd).map(|reg| PollEvent {
                        fd,
                        readiness,
                        target: reg.target.clone(),
                    })
                })
                .collect()
        };

        if events.is_empty() && !notified {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.events
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(events)
    }

    /// Interrupt a concurrent or the next `wait`.
    pub fn notify(&self) -> Result<(), PollError> {
        self.selector.notify()?;
        Ok(())
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            total_waits: self.waits.load(Ordering::Relaxed),
            total_events: self.events.load(Ordering::Relaxed),
            total_timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for Poller<T> {
    fn drop(&mut self) {
        let regs = lock(&self.registrations);
        for (&fd, reg) in regs.iter() {
            let _ = self.selector.delete(fd, reg.interest);
        }
    }
}
