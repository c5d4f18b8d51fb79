//! Route Controller (C6, §4.6) — a pure scoring function over rolling
//! transport-health statistics, deciding between `selfOnion`, `onionRouter`,
//! and `directP2P`.

use std::collections::VecDeque;

use crate::config::{NetConfig, NetworkMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportChoice {
    DirectP2p,
    SelfOnion,
    OnionRouter,
}

/// Rolling statistics consulted by `decide_transport`. Held inside
/// `CoreContext` behind a mutex; updated by `report_ack`/`report_send_fail`
/// as the router observes outcomes.
#[derive(Debug, Clone)]
pub struct RouteStats {
    rtt_ms_window: VecDeque<u64>,
    send_outcomes: VecDeque<bool>,
    route_build_fail_streak: u32,
    relay_pool_size: u32,
    fallback_until_ms: i64,
    /// Timestamp the p95 RTT first exceeded 10s continuously, or `None`.
    high_rtt_since_ms: Option<i64>,
}

const RTT_WINDOW: usize = 200;
const OUTCOME_WINDOW: usize = 20;
const FAIL_STREAK_THRESHOLD: u32 = 3;
const FALLBACK_HOLD_MS: i64 = 2 * 60 * 1000;
const HIGH_RTT_THRESHOLD_MS: u64 = 10_000;
const HIGH_RTT_SUSTAIN_MS: i64 = 2 * 60 * 1000;

impl Default for RouteStats {
    fn default() -> Self {
        RouteStats {
            rtt_ms_window: VecDeque::with_capacity(RTT_WINDOW),
            send_outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
            route_build_fail_streak: 0,
            relay_pool_size: 0,
            fallback_until_ms: 0,
            high_rtt_since_ms: None,
        }
    }
}

impl RouteStats {
    pub fn report_ack(&mut self, rtt_ms: u64) {
        if self.rtt_ms_window.len() == RTT_WINDOW {
            self.rtt_ms_window.pop_front();
        }
        self.rtt_ms_window.push_back(rtt_ms);
        self.push_outcome(true);
    }

    pub fn report_send_fail(&mut self) {
        self.push_outcome(false);
    }

    fn push_outcome(&mut self, ok: bool) {
        if self.send_outcomes.len() == OUTCOME_WINDOW {
            self.send_outcomes.pop_front();
        }
        self.send_outcomes.push_back(ok);
    }

    pub fn report_route_build_failure(&mut self) {
        self.route_build_fail_streak += 1;
    }

    pub fn report_route_build_success(&mut self) {
        self.route_build_fail_streak = 0;
    }

    pub fn set_relay_pool_size(&mut self, size: u32) {
        self.relay_pool_size = size;
    }

    fn failure_rate(&self) -> f64 {
        if self.send_outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.send_outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.send_outcomes.len() as f64
    }

    /// Nearest-rank p95 over the RTT window; `0` when no samples exist.
    fn p95_rtt_ms(&self) -> u64 {
        if self.rtt_ms_window.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.rtt_ms_window.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }

    /// Update the high-RTT sustain tracker; returns whether it has now been
    /// sustained for at least `HIGH_RTT_SUSTAIN_MS`.
    fn update_high_rtt_tracker(&mut self, now_ms: i64) -> bool {
        let p95 = self.p95_rtt_ms();
        if p95 > HIGH_RTT_THRESHOLD_MS {
            let since = *self.high_rtt_since_ms.get_or_insert(now_ms);
            now_ms - since >= HIGH_RTT_SUSTAIN_MS
        } else {
            self.high_rtt_since_ms = None;
            false
        }
    }
}

/// Implements the decision table of §4.6 exactly, in row order.
pub fn decide_transport(config: &NetConfig, stats: &mut RouteStats, now_ms: i64) -> TransportChoice {
    if config.mode == NetworkMode::DirectP2p {
        return TransportChoice::DirectP2p;
    }
    if config.mode == NetworkMode::OnionRouter {
        return TransportChoice::OnionRouter;
    }
    if config.mode == NetworkMode::SelfOnion && !config.self_onion_enabled {
        return TransportChoice::OnionRouter;
    }
    if stats.fallback_until_ms > now_ms {
        return TransportChoice::OnionRouter;
    }
    if stats.route_build_fail_streak >= FAIL_STREAK_THRESHOLD {
        stats.fallback_until_ms = now_ms + FALLBACK_HOLD_MS;
        return TransportChoice::OnionRouter;
    }
    if stats.relay_pool_size > 0 && stats.relay_pool_size < config.self_onion_min_relays {
        return TransportChoice::OnionRouter;
    }
    if stats.failure_rate() > 0.30 {
        return TransportChoice::OnionRouter;
    }
    if stats.update_high_rtt_tracker(now_ms) {
        return TransportChoice::OnionRouter;
    }
    TransportChoice::SelfOnion
}
