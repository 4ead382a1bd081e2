// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

// See https://prometheus.io/docs/practices/naming/

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::Opts;
pub use prometheus::{IntCounter, IntGauge};
use serde::Serialize;

pub fn new_counter(name: &str, description: &str, namespace: &str) -> IntCounter {
    let counter_opts = Opts::new(name, description).namespace(namespace);
    let counter = IntCounter::with_opts(counter_opts).expect("Failed to create counter");
    prometheus::register(Box::new(counter.clone())).expect("Failed to register counter");
    counter
}

pub fn new_gauge(name: &str, description: &str, namespace: &str) -> IntGauge {
    let gauge_opts = Opts::new(name, description).namespace(namespace);
    let gauge = IntGauge::with_opts(gauge_opts).expect("Failed to create gauge");
    prometheus::register(Box::new(gauge.clone())).expect("Failed to register gauge");
    gauge
}

/// Process-global accounting of time spent waiting inside the retry loop.
///
/// Throttle waits are sleeps dictated by a service `Retry-After` header;
/// timeout waits cover every other backoff (connect/read timeouts, 5xx).
/// All fields are plain atomic adds so workers never contend on a lock.
pub struct TransferPerfCounters {
    ms_wait_throttled: AtomicU64,
    ms_wait_timeouts: AtomicU64,
    count_throttled: AtomicU64,
    count_timeouts: AtomicU64,
}

/// Point-in-time copy of [`TransferPerfCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PerfCountersSnapshot {
    pub ms_wait_throttled: u64,
    pub ms_wait_timeouts: u64,
    pub count_throttled: u64,
    pub count_timeouts: u64,
}

impl TransferPerfCounters {
    const fn new() -> Self {
        TransferPerfCounters {
            ms_wait_throttled: AtomicU64::new(0),
            ms_wait_timeouts: AtomicU64::new(0),
            count_throttled: AtomicU64::new(0),
            count_timeouts: AtomicU64::new(0),
        }
    }

    pub fn add_throttled_wait(&self, wait: Duration) {
        self.ms_wait_throttled
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        self.count_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_timeout_wait(&self, wait: Duration) {
        self.ms_wait_timeouts
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        self.count_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerfCountersSnapshot {
        PerfCountersSnapshot {
            ms_wait_throttled: self.ms_wait_throttled.load(Ordering::Relaxed),
            ms_wait_timeouts: self.ms_wait_timeouts.load(Ordering::Relaxed),
            count_throttled: self.count_throttled.load(Ordering::Relaxed),
            count_timeouts: self.count_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.ms_wait_throttled.store(0, Ordering::Relaxed);
        self.ms_wait_timeouts.store(0, Ordering::Relaxed);
        self.count_throttled.store(0, Ordering::Relaxed);
        self.count_timeouts.store(0, Ordering::Relaxed);
    }
}

/// Counters updated by the retry loop, surfaced through
/// `get_perf_counters()` / `reset_perf_counters()` in `azstore-storage`.
pub static TRANSFER_PERF_COUNTERS: TransferPerfCounters = TransferPerfCounters::new();
