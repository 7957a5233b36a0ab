//! Brutal 定速拥塞控制
//!
//! 拥塞窗口只由目标速率、RTT 和最近几秒的确认率决定，丢包不会让窗口收缩。

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quinn::congestion::{Controller, ControllerFactory};
use quinn_proto::RttEstimator;

const SLOT_COUNT: usize = 5;
const MIN_SAMPLE_COUNT: u64 = 50;
const MIN_ACK_RATE: f64 = 0.8;
const WINDOW_MULTIPLIER: f64 = 2.0;
/// 还没有 RTT 样本时的窗口
const NO_RTT_WINDOW: u64 = 10240;
/// 窗口下限，以 MTU 计
///
/// quinn 在 `in_flight + mtu >= window` 时停止发送，窗口必须比一个 MTU 大。
const MIN_WINDOW_PACKETS: u64 = 2;

/// 以秒为粒度统计确认和丢失的字节
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    second: u64,
    acked: u64,
    lost: u64,
    samples: u64,
}

#[derive(Debug, Clone)]
pub struct BrutalConfig {
    bps: u64,
}

impl BrutalConfig {
    pub fn new(bps: u64) -> Self {
        Self { bps }
    }
}

impl ControllerFactory for BrutalConfig {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(Brutal::new(self.bps, now, current_mtu))
    }
}

#[derive(Debug, Clone)]
pub struct Brutal {
    bps: u64,
    epoch: Instant,
    mtu: u64,
    slots: [Slot; SLOT_COUNT],
    ack_rate: f64,
    window: u64,
}

impl Brutal {
    pub fn new(bps: u64, now: Instant, mtu: u16) -> Self {
        Self {
            bps,
            epoch: now,
            mtu: u64::from(mtu),
            slots: [Slot::default(); SLOT_COUNT],
            ack_rate: 1.0,
            window: NO_RTT_WINDOW.max(MIN_WINDOW_PACKETS * u64::from(mtu)),
        }
    }

    fn min_window(&self) -> u64 {
        MIN_WINDOW_PACKETS * self.mtu
    }

    fn slot(&mut self, now: Instant) -> &mut Slot {
        let second = now.saturating_duration_since(self.epoch).as_secs();
        let slot = &mut self.slots[(second % SLOT_COUNT as u64) as usize];
        if slot.second != second || slot.samples == 0 {
            *slot = Slot {
                second,
                ..Slot::default()
            };
        }
        slot
    }

    fn update_ack_rate(&mut self, now: Instant) {
        let current = now.saturating_duration_since(self.epoch).as_secs();
        let (acked, lost, samples) = self
            .slots
            .iter()
            .filter(|s| s.samples > 0 && current.saturating_sub(s.second) < SLOT_COUNT as u64)
            .fold((0u64, 0u64, 0u64), |(a, l, n), s| (a + s.acked, l + s.lost, n + s.samples));

        self.ack_rate = if samples < MIN_SAMPLE_COUNT || acked + lost == 0 {
            1.0
        } else {
            (acked as f64 / (acked + lost) as f64).max(MIN_ACK_RATE)
        };
    }

    fn update_window(&mut self, rtt: Duration) {
        if rtt.is_zero() {
            self.window = NO_RTT_WINDOW.max(self.min_window());
            return;
        }
        let window = self.bps as f64 * rtt.as_secs_f64() * WINDOW_MULTIPLIER / self.ack_rate;
        self.window = (window as u64).max(self.min_window());
    }
}

impl Controller for Brutal {
    fn on_ack(
        &mut self,
        now: Instant,
        _sent: Instant,
        bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        let slot = self.slot(now);
        slot.acked += bytes;
        slot.samples += 1;
        self.update_ack_rate(now);
        self.update_window(rtt.get());
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        let slot = self.slot(now);
        slot.lost += lost_bytes;
        slot.samples += 1;
        self.update_ack_rate(now);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = u64::from(new_mtu);
        self.window = self.window.max(self.min_window());
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        NO_RTT_WINDOW.max(self.min_window())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
