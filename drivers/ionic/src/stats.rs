// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Per-queue counters.

/// Buckets of the per-poll work-done histogram; the last one collects the rest.
pub const NAPI_WORK_BUCKETS: usize = 9;

/// Transmit queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStats {
    pub pkts: u64,
    pub bytes: u64,
    pub clean: u64,
    pub dma_map_err: u64,
    pub linearize: u64,
    pub frags: u64,
    pub tso: u64,
    pub tso_bytes: u64,
    pub csum: u64,
    pub csum_none: u64,
    pub vlan_inserted: u64,
    pub stop: u64,
    pub wake: u64,
    pub drop: u64,
    pub comp_err: u64,
}

/// Receive queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxStats {
    pub pkts: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub alloc_err: u64,
    pub dma_map_err: u64,
    pub csum_complete: u64,
    pub csum_none: u64,
    pub csum_error: u64,
    pub vlan_stripped: u64,
    pub buffers_posted: u64,
    pub comp_err: u64,
}

/// Poll and doorbell counters, kept only with `debug_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugStats {
    pub napi_poll: u64,
    pub napi_work_done: [u64; NAPI_WORK_BUCKETS],
    pub intr_rearm: u64,
    pub doorbells: u64,
    pub posts: u64,
}

impl DebugStats {
    pub fn record_poll(&mut self, work_done: u32) {
        self.napi_poll += 1;
        let bucket = (work_done as usize).min(NAPI_WORK_BUCKETS - 1);
        self.napi_work_done[bucket] += 1;
    }

    pub fn record_post(&mut self, ring_doorbell: bool) {
        self.posts += 1;
        if ring_doorbell {
            self.doorbells += 1;
        }
    }
}

const RATELIMIT_BURST: u32 = 10;
const RATELIMIT_INTERVAL: u32 = 64;

/// Count-based log limiter: a burst of messages, then one in every
/// `RATELIMIT_INTERVAL` until [`RateLimit::reset`].
#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    events: u32,
    suppressed: u32,
}

impl RateLimit {
    pub const fn new() -> Self {
        Self {
            events: 0,
            suppressed: 0,
        }
    }

    /// Returns whether the current event may be logged.
    pub fn allow(&mut self) -> bool {
        let n = self.events;
        self.events = self.events.wrapping_add(1);
        if n < RATELIMIT_BURST || (n - RATELIMIT_BURST) % RATELIMIT_INTERVAL == RATELIMIT_INTERVAL - 1
        {
            true
        } else {
            self.suppressed += 1;
            false
        }
    }

    /// Messages swallowed so far.
    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Logs through `log` at `$lvl` if the limiter allows it.
macro_rules! log_ratelimited {
    ($rl:expr, $lvl:ident, $($arg:tt)+) => {
        if $rl.allow() {
            log::$lvl!($($arg)+);
        }
    };
}

pub(crate) use log_ratelimited;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratelimit_burst_then_sparse() {
        let mut rl = RateLimit::new();
        let allowed = (0..10 + 128).filter(|_| rl.allow()).count();
        assert_eq!(allowed, 12);
        assert_eq!(rl.suppressed(), 126);
        rl.reset();
        assert!(rl.allow());
    }

    #[test]
    fn work_done_histogram_saturates() {
        let mut d = DebugStats::default();
        d.record_poll(0);
        d.record_poll(3);
        d.record_poll(500);
        assert_eq!(d.napi_poll, 3);
        assert_eq!(d.napi_work_done[0], 1);
        assert_eq!(d.napi_work_done[3], 1);
        assert_eq!(d.napi_work_done[NAPI_WORK_BUCKETS - 1], 1);
    }
}
