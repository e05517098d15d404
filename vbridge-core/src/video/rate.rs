//! Frame pacing and adaptive bitrate control.
//!
//! [`RateController`] decides when the next frame may be pulled. Every
//! format is limited by the maximum frame rate. Encoded formats are
//! additionally paced by the current bitrate: a frame of `n` bytes
//! "costs" `n * 8 / bitrate` seconds of link time.
//!
//! The bitrate itself follows the bandwidth estimated from recent sends
//! (payload bytes divided by the time the transport took to accept
//! them), clamped to `[min_bitrate, max_bitrate]`. When the link cannot
//! even carry the floor the bitrate is held there and the frame rate
//! drops instead.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

// ── RateTuning ───────────────────────────────────────────────────

/// Tuning constants for [`RateController`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateTuning {
    /// EMA coefficient for the send-latency estimate (0..=1).
    pub latency_alpha: f64,
    /// Rolling window over which bandwidth samples are kept.
    pub bandwidth_window: Duration,
    /// Fraction of the estimated bandwidth the bitrate may use.
    pub headroom: f64,
    /// Largest multiplicative bitrate increase per send.
    pub max_increase: f64,
    /// Longest single sleep while waiting for budget; the budget is
    /// re-checked after each slice.
    pub recheck_interval: Duration,
}

impl Default for RateTuning {
    fn default() -> Self {
        Self {
            latency_alpha: 0.125,
            bandwidth_window: Duration::from_secs(1),
            headroom: 0.9,
            max_increase: 1.25,
            recheck_interval: Duration::from_millis(50),
        }
    }
}

// ── RateController ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
    elapsed: Duration,
}

/// Per-session pacing state. Bitrates are in bits per second.
#[derive(Debug)]
pub struct RateController {
    max_frame_rate: u32,
    render_frame_rate: Option<f64>,
    /// Effective floor, already reduced to `max_bitrate` when inverted.
    min_bitrate: u32,
    /// `0` means no limit.
    max_bitrate: u32,
    bit_rate: u32,
    bitrate_controlled: bool,
    last_send: Option<Instant>,
    /// Extra gap after the last send on top of the frame interval.
    pacing: Duration,
    samples: VecDeque<Sample>,
    window_bytes: u64,
    window_busy: Duration,
    latency_us: Option<f64>,
    tuning: RateTuning,
}

impl RateController {
    pub fn new(tuning: RateTuning) -> Self {
        Self {
            max_frame_rate: 30,
            render_frame_rate: None,
            min_bitrate: 0,
            max_bitrate: 0,
            bit_rate: 0,
            bitrate_controlled: false,
            last_send: None,
            pacing: Duration::ZERO,
            samples: VecDeque::with_capacity(64),
            window_bytes: 0,
            window_busy: Duration::ZERO,
            latency_us: None,
            tuning,
        }
    }

    /// Apply new limits. `max_bitrate` wins over `min_bitrate` when the
    /// two are inverted; `max_bitrate == 0` lifts the bitrate limit.
    pub fn configure(
        &mut self,
        max_frame_rate: u32,
        min_bitrate: u32,
        max_bitrate: u32,
        bitrate_controlled: bool,
    ) {
        self.max_frame_rate = max_frame_rate.max(1);
        self.max_bitrate = max_bitrate;
        self.bitrate_controlled = bitrate_controlled;

        if max_bitrate == 0 {
            self.min_bitrate = min_bitrate;
            self.bit_rate = 0;
        } else {
            self.min_bitrate = min_bitrate.min(max_bitrate);
            self.bit_rate = if self.bit_rate == 0 {
                max_bitrate
            } else {
                self.bit_rate.clamp(self.min_bitrate, max_bitrate)
            };
        }

        if !self.is_limited() {
            self.pacing = Duration::ZERO;
        }
    }

    /// Optional hint about the rate the producer actually renders at.
    pub fn set_render_frame_rate(&mut self, rate: Option<f64>) {
        self.render_frame_rate = rate;
    }

    /// Whether bitrate pacing is active.
    pub fn is_limited(&self) -> bool {
        self.bitrate_controlled && self.max_bitrate > 0
    }

    /// Minimum gap between two sends imposed by the frame rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_frame_rate as f64)
    }

    /// Time left until the next frame may be sent.
    pub fn delay_until(&self, now: Instant) -> Duration {
        let Some(last) = self.last_send else {
            return Duration::ZERO;
        };
        let gap = self.frame_interval().max(self.pacing);
        (last + gap).saturating_duration_since(now)
    }

    /// Whether the budget admits a send at `now`.
    pub fn should_send_now(&self, now: Instant) -> bool {
        self.delay_until(now).is_zero()
    }

    /// Record a completed send of `bytes` that took `elapsed` to hand to
    /// the transport, finishing at `now`.
    pub fn on_sent(&mut self, bytes: u64, elapsed: Duration, now: Instant) {
        self.last_send = Some(now);
        self.record(now, bytes, elapsed);
        self.update_latency(elapsed);

        if !self.is_limited() {
            self.pacing = Duration::ZERO;
            return;
        }

        let interval = self.frame_interval();
        let estimate = self.estimated_bandwidth();

        if estimate > 0 && estimate < self.min_bitrate as u64 {
            // Link cannot carry the floor: hold the bitrate and skip a cycle.
            self.bit_rate = self.min_bitrate;
            let drain = Duration::from_secs_f64(bytes as f64 * 8.0 / estimate as f64);
            self.pacing = drain.max(interval * 2);
            debug!(
                estimate,
                floor = self.min_bitrate,
                pacing_ms = self.pacing.as_millis() as u64,
                "bandwidth below bitrate floor, reducing frame rate"
            );
            return;
        }

        if estimate > 0 {
            let target = (estimate as f64 * self.tuning.headroom) as u64;
            let ceiling = (self.bit_rate as f64 * self.tuning.max_increase) as u64;
            let next = target
                .min(ceiling)
                .clamp(self.min_bitrate as u64, self.max_bitrate as u64);
            self.bit_rate = next as u32;
        }

        self.pacing = if self.bit_rate > 0 {
            Duration::from_secs_f64(bytes as f64 * 8.0 / self.bit_rate as f64)
        } else {
            Duration::ZERO
        };
    }

    /// Byte budget for the next frame, `None` when bitrate is not limited.
    pub fn frame_budget_bytes(&self) -> Option<usize> {
        if !self.is_limited() {
            return None;
        }
        let mut fps = self.max_frame_rate as f64;
        if let Some(render) = self.render_frame_rate {
            if render > 0.0 && render < fps {
                fps = render;
            }
        }
        Some((self.bit_rate as f64 / 8.0 / fps) as usize)
    }

    /// Estimated available bandwidth in bits/second (`0` if unknown).
    pub fn estimated_bandwidth(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let busy = if self.window_busy.is_zero() {
            Duration::from_millis(1)
        } else {
            self.window_busy
        };
        (self.window_bytes as f64 * 8.0 / busy.as_secs_f64()) as u64
    }

    /// Smoothed send latency, `Duration::ZERO` before the first send.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.unwrap_or(0.0) as u64)
    }

    /// Current bitrate (`0` when unlimited).
    pub fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    pub fn min_bitrate(&self) -> u32 {
        self.min_bitrate
    }

    pub fn max_bitrate(&self) -> u32 {
        self.max_bitrate
    }

    pub fn max_frame_rate(&self) -> u32 {
        self.max_frame_rate
    }

    pub fn tuning(&self) -> &RateTuning {
        &self.tuning
    }

    /// Number of bandwidth samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    // ── Internal ─────────────────────────────────────────────────

    fn record(&mut self, at: Instant, bytes: u64, elapsed: Duration) {
        self.samples.push_back(Sample { at, bytes, elapsed });
        self.window_bytes += bytes;
        self.window_busy += elapsed;

        while let Some(&oldest) = self.samples.front() {
            if at.saturating_duration_since(oldest.at) > self.tuning.bandwidth_window {
                self.samples.pop_front();
                self.window_bytes = self.window_bytes.saturating_sub(oldest.bytes);
                self.window_busy = self.window_busy.saturating_sub(oldest.elapsed);
            } else {
                break;
            }
        }
    }

    fn update_latency(&mut self, elapsed: Duration) {
        let sample = elapsed.as_micros() as f64;
        let alpha = self.tuning.latency_alpha;
        self.latency_us = Some(match self.latency_us {
            None => sample,
            Some(prev) => prev * (1.0 - alpha) + sample * alpha,
        });
    }
}

impl Default for RateController {
    fn default() -> Self {
        Self::new(RateTuning::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MBIT: u32 = 1_000_000;

    #[test]
    fn first_frame_is_always_admitted() {
        let rate = RateController::default();
        assert!(rate.should_send_now(Instant::now()));
    }

    #[test]
    fn frame_rate_gates_unencoded_formats() {
        let mut rate = RateController::default();
        rate.configure(30, 0, 0, false);
        let t0 = Instant::now();
        rate.on_sent(10_000_000, Duration::from_secs(2), t0);

        // Payload size and slow link are ignored: only 1/30 s matters.
        assert!(!rate.should_send_now(t0 + Duration::from_millis(10)));
        assert!(rate.should_send_now(t0 + Duration::from_millis(34)));
        assert_eq!(rate.frame_budget_bytes(), None);
    }

    #[test]
    fn max_bitrate_wins_when_inverted() {
        let mut rate = RateController::default();
        rate.configure(30, 5 * MBIT, MBIT, true);
        assert_eq!(rate.min_bitrate(), MBIT);
        assert_eq!(rate.bit_rate(), MBIT);
    }

    #[test]
    fn bitrate_capped_at_max_on_fast_link() {
        let mut rate = RateController::default();
        rate.configure(30, MBIT, 4 * MBIT, true);
        let t0 = Instant::now();
        // 1 MB in 1 ms ≈ 8 Gbit/s.
        for i in 0..20 {
            rate.on_sent(1_000_000, Duration::from_millis(1), t0 + Duration::from_millis(i * 40));
        }
        assert_eq!(rate.bit_rate(), 4 * MBIT);
    }

    #[test]
    fn slow_link_holds_floor_and_lowers_frame_rate() {
        let mut rate = RateController::default();
        rate.configure(30, 2 * MBIT, 8 * MBIT, true);
        let t0 = Instant::now();
        // 10 kB per 100 ms ≈ 0.8 Mbit/s, below the 2 Mbit/s floor.
        rate.on_sent(10_000, Duration::from_millis(100), t0);

        assert_eq!(rate.bit_rate(), 2 * MBIT);
        let delay = rate.delay_until(t0);
        assert!(delay >= rate.frame_interval() * 2, "delay = {delay:?}");
    }

    #[test]
    fn bitrate_rises_gradually() {
        let mut rate = RateController::default();
        rate.configure(30, MBIT, 100 * MBIT, true);
        let t0 = Instant::now();
        rate.on_sent(10_000, Duration::from_millis(100), t0); // ≈ 0.8 Mbit/s
        assert_eq!(rate.bit_rate(), MBIT);

        // Fast link afterwards: bitrate increases, but by at most 25 %.
        rate.on_sent(1_000_000, Duration::from_millis(1), t0 + Duration::from_millis(50));
        assert!(rate.bit_rate() > MBIT);
        assert!(rate.bit_rate() <= MBIT * 5 / 4);
    }

    #[test]
    fn budget_follows_render_rate_hint() {
        let mut rate = RateController::default();
        rate.configure(30, 0, 8 * MBIT, true);
        assert_eq!(rate.frame_budget_bytes(), Some(1_000_000 / 30));
        rate.set_render_frame_rate(Some(10.0));
        assert_eq!(rate.frame_budget_bytes(), Some(100_000));
    }

    #[test]
    fn latency_ema() {
        let mut rate = RateController::default();
        let t0 = Instant::now();
        rate.on_sent(100, Duration::from_millis(10), t0);
        assert_eq!(rate.latency(), Duration::from_millis(10));

        rate.on_sent(100, Duration::from_millis(2), t0 + Duration::from_millis(40));
        // 10 ms * 7/8 + 2 ms / 8 = 9 ms
        let us = rate.latency().as_micros();
        assert!(us > 8_000 && us < 10_000, "latency = {us} us");
    }

    #[test]
    fn evicts_samples_outside_window() {
        let mut rate = RateController::new(RateTuning {
            bandwidth_window: Duration::from_millis(500),
            ..RateTuning::default()
        });
        let t0 = Instant::now();
        rate.on_sent(1000, Duration::from_millis(1), t0);
        rate.on_sent(500, Duration::from_millis(1), t0 + Duration::from_secs(1));
        assert_eq!(rate.sample_count(), 1);
    }
}
