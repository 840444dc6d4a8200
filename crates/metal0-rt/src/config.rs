// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.

use std::thread;

/// Environment variable overriding the processor count.
pub const MAX_PROCS_ENV: &str = "METAL0_MAX_PROCS";

/// The externally configurable surface of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of processors, one OS thread each. 0 means "one per core".
    pub num_processors: usize,
    /// Idle processors steal from busier peers.
    pub enable_work_stealing: bool,
    /// `yield_point` re-queues tasks that overran their time slice.
    pub enable_preemption: bool,
}

impl RuntimeConfig {
    /// One processor, no stealing, no preemption. Deterministic.
    pub fn single_threaded() -> Self {
        Self {
            num_processors: 1,
            enable_work_stealing: false,
            enable_preemption: false,
        }
    }

    /// Default config with `METAL0_MAX_PROCS` applied when it parses
    /// as a positive integer.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = std::env::var(MAX_PROCS_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            config.num_processors = n;
        }
        config
    }

    pub fn with_processors(mut self, n: usize) -> Self {
        self.num_processors = n;
        self
    }

    pub fn with_work_stealing(mut self, enabled: bool) -> Self {
        self.enable_work_stealing = enabled;
        self
    }

    pub fn with_preemption(mut self, enabled: bool) -> Self {
        self.enable_preemption = enabled;
        self
    }

    /// Processor count with 0 resolved to the core count.
    pub(crate) fn processors(&self) -> usize {
        if self.num_processors == 0 {
            default_processors()
        } else {
            self.num_processors
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_processors: default_processors(),
            enable_work_stealing: true,
            enable_preemption: true,
        }
    }
}

fn default_processors() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}
