//! 注入式時鐘、指數退避與取消標記。
//!
//! 所有輪詢與重試都透過 [`Clock`] 取得時間與睡眠，測試時可換成 [`ManualClock`]
//! 讓虛擬時間在 `sleep` 呼叫時直接前進。

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// 可中斷睡眠時每一段的最長等待時間。
const SLEEP_SLICE: Duration = Duration::from_millis(100);

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// 以作業系統時間實作的時鐘。
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// 手動推進的時鐘，`sleep` 不會真的阻塞，而是把虛擬時間往前推。
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += duration;
    }

    /// 自建立以來經過的虛擬時間。
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        thread::yield_now();
    }
}

/// 呼叫端持有的取消標記，可跨執行緒複製共享。
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 分段睡眠 `duration`，期間若被取消立即返回 `false`。
pub fn sleep_with_cancel(clock: &dyn Clock, duration: Duration, cancel: &CancelToken) -> bool {
    let deadline = clock.now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = clock.now();
        if now >= deadline {
            return true;
        }
        clock.sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// 指數退避：每次延遲加倍，直到上限。
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = current.saturating_mul(2).min(self.max);
        current
    }
}
