//! 读写截止时间控制
//!
//! 每个方向（读/写）各有一个取消作用域（`CancellationToken`）和一个可撤销的定时器，
//! 两个方向共用一把锁。作用域被触发后，阻塞中或之后的读/写都会以
//! [`Error::DeadlineExceeded`](crate::Error::DeadlineExceeded) 失败，直到作用域被重新置为有效。
//!
//! 重新设置一个未来的截止时间时，如果旧作用域已被触发，会先换上一个全新的作用域再启动定时器，
//! 已经观察到旧作用域触发的操作不会因此"复活"。

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// 单个方向的截止时间状态
#[derive(Debug)]
struct DirectionState {
    scope: CancellationToken,
    timer: Option<JoinHandle<()>>,
    /// 每次重新布置或撤销定时器都会递增，过期的定时器据此放弃触发
    generation: u64,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            scope: CancellationToken::new(),
            timer: None,
            generation: 0,
        }
    }

    /// 作用域已触发时换成新的作用域
    fn refresh(&mut self) {
        if self.scope.is_cancelled() {
            self.scope = CancellationToken::new();
        }
    }

    fn disarm(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn trip(&mut self) {
        if !self.scope.is_cancelled() {
            self.scope.cancel();
        }
    }
}

#[derive(Debug)]
struct DeadlineState {
    read: DirectionState,
    write: DirectionState,
}

impl DeadlineState {
    fn direction(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

/// 连接适配器共享的截止时间控制器
///
/// `None` 表示"没有截止时间"：不会启动定时器，已有的定时器被撤销，已触发的作用域被重置。
/// 设置未来的截止时间需要在 Tokio 运行时中调用（定时器是一个后台任务）。
#[derive(Debug)]
pub struct DeadlineController {
    state: Arc<Mutex<DeadlineState>>,
}

impl DeadlineController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeadlineState {
                read: DirectionState::new(),
                write: DirectionState::new(),
            })),
        }
    }

    /// 同时设置读和写的截止时间
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut state = self.lock();
        self.update(&mut state, Direction::Read, deadline);
        self.update(&mut state, Direction::Write, deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut state = self.lock();
        self.update(&mut state, Direction::Read, deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        let mut state = self.lock();
        self.update(&mut state, Direction::Write, deadline);
    }

    /// 当前的读作用域
    ///
    /// 返回的是作用域的一个句柄；之后即使作用域被替换，这个句柄仍指向调用时的那个作用域。
    pub fn read_scope(&self) -> CancellationToken {
        self.lock().read.scope.clone()
    }

    /// 当前的写作用域
    pub fn write_scope(&self) -> CancellationToken {
        self.lock().write.scope.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DeadlineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, state: &mut DeadlineState, direction: Direction, deadline: Option<Instant>) {
        let dir = state.direction(direction);
        match deadline {
            None => {
                dir.disarm();
                dir.refresh();
            }
            Some(at) if at > Instant::now() => {
                dir.refresh();
                dir.disarm();
                let generation = dir.generation;
                let weak = Arc::downgrade(&self.state);
                dir.timer = Some(tokio::spawn(fire_at(weak, direction, generation, at)));
            }
            Some(_) => dir.trip(),
        }
    }
}

impl Default for DeadlineController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeadlineController {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.read.disarm();
        state.write.disarm();
    }
}

/// 定时器任务：到点后重新拿锁，只有仍是当前布置的定时器时才触发作用域
async fn fire_at(state: Weak<Mutex<DeadlineState>>, direction: Direction, generation: u64, at: Instant) {
    tokio::time::sleep_until(at).await;
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    let dir = state.direction(direction);
    if dir.generation == generation {
        dir.timer = None;
        dir.trip();
    }
}
