//! 拥塞控制选择
//!
//! quinn 只在建立连接时通过工厂创建一次拥塞控制器，而算法要等认证完成后才能确定。
//! 所以连接一开始使用 [`SwitchableCongestion`]：先按 Cubic 运行，握手结束后调用
//! [`SwitchableCongestion::switch`]，控制器在下一次回调时换成新的算法。

mod brutal;

pub use brutal::{Brutal, BrutalConfig};

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use quinn::congestion::{BbrConfig, Controller, ControllerFactory, CubicConfig};
use quinn_proto::RttEstimator;

/// 拥塞控制算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionStrategy {
    /// 握手完成前的默认算法
    Cubic,
    /// 带宽探测
    Bbr,
    /// 固定速率（字节/秒）
    Brutal { bps: u64 },
}

/// 根据认证结果选择拥塞控制算法
///
/// 返回选中的算法和实际发送速率（BBR 时为 0）。
pub fn select_congestion(rx_auto: bool, server_rx: u64, client_max_tx: u64) -> (CongestionStrategy, u64) {
    if rx_auto {
        // 服务端要求客户端自行探测带宽，忽略本地带宽配置
        return (CongestionStrategy::Bbr, 0);
    }
    let tx = if server_rx == 0 || server_rx > client_max_tx {
        client_max_tx
    } else {
        server_rx
    };
    if tx > 0 {
        (CongestionStrategy::Brutal { bps: tx }, tx)
    } else {
        (CongestionStrategy::Bbr, 0)
    }
}

/// 连接建立后仍可切换算法的拥塞控制工厂
#[derive(Debug)]
pub struct SwitchableCongestion {
    generation: AtomicU64,
    strategy: Mutex<CongestionStrategy>,
}

impl SwitchableCongestion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            generation: AtomicU64::new(0),
            strategy: Mutex::new(CongestionStrategy::Cubic),
        })
    }

    /// 切换到新的算法，已创建的控制器在下一次回调时生效
    pub fn switch(&self, strategy: CongestionStrategy) {
        *self.strategy.lock().unwrap_or_else(|e| e.into_inner()) = strategy;
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn current(&self) -> CongestionStrategy {
        *self.strategy.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn build_inner(&self, now: Instant, mtu: u16) -> (u64, Box<dyn Controller>) {
        let generation = self.generation.load(Ordering::Acquire);
        let controller = match self.current() {
            CongestionStrategy::Cubic => Arc::new(CubicConfig::default()).build(now, mtu),
            CongestionStrategy::Bbr => Arc::new(BbrConfig::default()).build(now, mtu),
            CongestionStrategy::Brutal { bps } => Arc::new(BrutalConfig::new(bps)).build(now, mtu),
        };
        (generation, controller)
    }
}

impl ControllerFactory for SwitchableCongestion {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        let (generation, inner) = self.build_inner(now, current_mtu);
        Box::new(SwitchableController {
            factory: self,
            generation,
            inner,
            mtu: current_mtu,
        })
    }
}

struct SwitchableController {
    factory: Arc<SwitchableCongestion>,
    generation: u64,
    inner: Box<dyn Controller>,
    mtu: u16,
}

impl SwitchableController {
    fn sync(&mut self, now: Instant) {
        if self.factory.generation.load(Ordering::Acquire) != self.generation {
            let (generation, inner) = self.factory.build_inner(now, self.mtu);
            self.generation = generation;
            self.inner = inner;
        }
    }
}

impl Controller for SwitchableController {
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
        self.sync(now);
        self.inner.on_sent(now, bytes, last_packet_number);
    }

    fn on_ack(&mut self, now: Instant, sent: Instant, bytes: u64, app_limited: bool, rtt: &RttEstimator) {
        self.sync(now);
        self.inner.on_ack(now, sent, bytes, app_limited, rtt);
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        self.sync(now);
        self.inner
            .on_end_acks(now, in_flight, app_limited, largest_packet_num_acked);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        self.sync(now);
        self.inner
            .on_congestion_event(now, sent, is_persistent_congestion, lost_bytes);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = new_mtu;
        self.inner.on_mtu_update(new_mtu);
    }

    fn window(&self) -> u64 {
        self.inner.window()
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(SwitchableController {
            factory: self.factory.clone(),
            generation: self.generation,
            inner: self.inner.clone_box(),
            mtu: self.mtu,
        })
    }

    fn initial_window(&self) -> u64 {
        self.inner.initial_window()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
