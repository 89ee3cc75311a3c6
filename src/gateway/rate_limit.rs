//! Per-IP admission control for the agent WebSocket upgrade endpoint.
//!
//! State machine per §4.J: block after 5 failures within 5 minutes,
//! reject attempts closer together than 5 s, cap concurrent active
//! connections per ip at 10. A periodic sweep (driven by
//! [`super::ws::run_sweeper`]) garbage-collects entries that have gone
//! quiet.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

const FAIL_BLOCK_THRESHOLD: u32 = 5;
const FAIL_BLOCK_WINDOW_SECS: i64 = 5 * 60;
const TOO_FREQUENT_SECS: i64 = 5;
const MAX_ACTIVE_PER_IP: u32 = 10;
const GC_IDLE_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, Copy)]
struct IpState {
    active_count: u32,
    last_attempt: DateTime<Utc>,
    fail_count: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Admit,
    RateBlocked { retry_after_secs: i64 },
    TooFrequent,
    TooManyActive,
}

#[derive(Default)]
pub struct RateLimiter {
    by_ip: std::sync::Mutex<HashMap<IpAddr, IpState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_record_attempt(&self, ip: IpAddr) -> Admission {
        let now = Utc::now();
        let mut guard = self.by_ip.lock().expect("rate limiter poisoned");
        let state = guard.entry(ip).or_insert(IpState {
            active_count: 0,
            last_attempt: now - chrono::Duration::hours(1),
            fail_count: 0,
        });

        let since_last = (now - state.last_attempt).num_seconds();

        if state.fail_count >= FAIL_BLOCK_THRESHOLD && since_last < FAIL_BLOCK_WINDOW_SECS {
            return Admission::RateBlocked {
                retry_after_secs: FAIL_BLOCK_WINDOW_SECS - since_last,
            };
        }
        if since_last < TOO_FREQUENT_SECS {
            return Admission::TooFrequent;
        }
        if state.active_count >= MAX_ACTIVE_PER_IP {
            return Admission::TooManyActive;
        }

        state.last_attempt = now;
        Admission::Admit
    }

    pub fn record_success(&self, ip: IpAddr) {
        let mut guard = self.by_ip.lock().expect("rate limiter poisoned");
        if let Some(state) = guard.get_mut(&ip) {
            state.fail_count = 0;
            state.active_count += 1;
        }
    }

    pub fn record_fail(&self, ip: IpAddr) {
        let mut guard = self.by_ip.lock().expect("rate limiter poisoned");
        if let Some(state) = guard.get_mut(&ip) {
            state.fail_count += 1;
        }
    }

    pub fn record_disconnect(&self, ip: IpAddr) {
        let mut guard = self.by_ip.lock().expect("rate limiter poisoned");
        if let Some(state) = guard.get_mut(&ip) {
            state.active_count = state.active_count.saturating_sub(1);
        }
    }

    /// Drop entries that have been quiet for longer than `GC_IDLE_SECS`.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut guard = self.by_ip.lock().expect("rate limiter poisoned");
        guard.retain(|_, state| (now - state.last_attempt).num_seconds() < GC_IDLE_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[test]
    fn scenario_s5_five_failures_then_block() {
        let limiter = RateLimiter::new();
        // Seed the per-ip entry with one admitted attempt, then drive
        // fail_count to the threshold directly via record_fail — looping
        // check_and_record_attempt itself would only ever admit the first
        // call, since every later one lands inside the 5 s too-frequent
        // window.
        assert_eq!(limiter.check_and_record_attempt(ip()), Admission::Admit);
        for _ in 0..5 {
            limiter.record_fail(ip());
        }
        // Push last_attempt back outside the too-frequent window so the
        // next check is rejected specifically on the block path, not
        // merely on too-frequent.
        {
            let mut guard = limiter.by_ip.lock().unwrap();
            guard.get_mut(&ip()).unwrap().last_attempt = Utc::now() - chrono::Duration::seconds(10);
        }
        let admission = limiter.check_and_record_attempt(ip());
        assert!(matches!(admission, Admission::RateBlocked { .. }));
    }

    #[test]
    fn active_count_cap_is_enforced() {
        let limiter = RateLimiter::new();
        for i in 0..10 {
            let other_ip: IpAddr = format!("203.0.113.{}", 10 + i).parse().unwrap();
            assert_eq!(limiter.check_and_record_attempt(other_ip), Admission::Admit);
            limiter.record_success(other_ip);
        }
        // A single ip hammered past the cap is rejected once active_count
        // reaches the max. Seed the entry first — record_success is a
        // no-op for an ip the limiter has never seen an attempt from.
        let hot_ip = ip();
        assert_eq!(limiter.check_and_record_attempt(hot_ip), Admission::Admit);
        for _ in 0..MAX_ACTIVE_PER_IP {
            limiter.record_success(hot_ip);
        }
        // Force last_attempt far enough in the past to not trip too-frequent.
        {
            let mut guard = limiter.by_ip.lock().unwrap();
            guard.get_mut(&hot_ip).unwrap().last_attempt = Utc::now() - chrono::Duration::seconds(30);
        }
        assert_eq!(limiter.check_and_record_attempt(hot_ip), Admission::TooManyActive);
    }

    #[test]
    fn disconnect_frees_an_active_slot() {
        let limiter = RateLimiter::new();
        limiter.record_success(ip());
        limiter.record_success(ip());
        limiter.record_disconnect(ip());
        let guard = limiter.by_ip.lock().unwrap();
        assert_eq!(guard.get(&ip()).unwrap().active_count, 1);
    }
}
