use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;
use tracing::debug;

use crate::http::{HttpClient, HttpResponse};

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 快取為空且向 newNonce 端點取得也失敗。
    #[error("No nonce available from {url}: {reason}")]
    Exhausted { url: String, reason: String },
    #[error("Lock poisoned")]
    LockPoisoned,
}

type Result<T> = std::result::Result<T, NonceError>;

/// 定義取得與消耗 Nonce 的行為。
pub trait NonceT: Send + Sync {
    /// 取得一個尚未使用的 Nonce。
    fn acquire(&self) -> Result<String>;
    /// 標記 Nonce 已使用，之後不會再被發出。
    fn consume(&self, nonce: &str);
}

/// 記錄已消耗 Nonce 的上限，超過後淘汰最舊的。
const CONSUMED_HISTORY: usize = 1024;
/// 顯式抓取的嘗試次數：先 HEAD，再退回 GET。
const FETCH_ATTEMPTS: usize = 2;

#[derive(Debug, Default)]
struct NonceState {
    cached: Option<String>,
    consumed: HashSet<String>,
    consumed_order: VecDeque<String>,
}

impl NonceState {
    fn mark_consumed(&mut self, nonce: &str) {
        if self.cached.as_deref() == Some(nonce) {
            self.cached = None;
        }
        if !self.consumed.insert(nonce.to_string()) {
            return;
        }
        self.consumed_order.push_back(nonce.to_string());
        if self.consumed_order.len() > CONSUMED_HISTORY {
            if let Some(oldest) = self.consumed_order.pop_front() {
                self.consumed.remove(&oldest);
            }
        }
    }
}

/// 管理單一帳戶工作階段的 Replay-Nonce。
///
/// 快取最多保留一個 Nonce；每個回應的 `Replay-Nonce` 都會透過 [`NonceManager::observe`]
/// 取代快取值，避免額外的 newNonce 往返。所有狀態都在同一把鎖下修改，
/// 因此同一個 Nonce 不會同時交給兩個請求。
#[derive(Debug)]
pub struct NonceManager {
    http: Arc<dyn HttpClient>,
    new_nonce_url: Mutex<String>,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(http: Arc<dyn HttpClient>, new_nonce_url: impl Into<String>) -> Self {
        Self {
            http,
            new_nonce_url: Mutex::new(new_nonce_url.into()),
            state: Mutex::new(NonceState::default()),
        }
    }

    /// 目錄更新後改用新的 newNonce 端點；端點改變時清除快取。
    pub fn retarget(&self, new_nonce_url: &str) -> Result<()> {
        let mut url = self
            .new_nonce_url
            .lock()
            .map_err(|_| NonceError::LockPoisoned)?;
        if *url != new_nonce_url {
            *url = new_nonce_url.to_string();
            self.lock()?.cached = None;
        }
        Ok(())
    }

    /// 從任一回應擷取替換用的 Nonce。
    pub fn observe(&self, response: &HttpResponse) {
        let Some(nonce) = response.replay_nonce() else {
            return;
        };
        if let Ok(mut state) = self.lock() {
            if !state.consumed.contains(nonce) {
                state.cached = Some(nonce.to_string());
            }
        }
    }

    fn fetch(&self) -> Result<String> {
        let url = self
            .new_nonce_url
            .lock()
            .map_err(|_| NonceError::LockPoisoned)?
            .clone();
        let mut reason = String::new();
        for attempt in 0..FETCH_ATTEMPTS {
            debug!(url = %url, attempt, "Fetching fresh nonce");
            let response = if attempt == 0 {
                self.http.head(&url)
            } else {
                self.http.get(&url)
            };
            match response {
                Ok(response) => match response.replay_nonce() {
                    Some(nonce) => {
                        let state = self.lock()?;
                        if !state.consumed.contains(nonce) {
                            return Ok(nonce.to_string());
                        }
                        reason = "server returned an already used nonce".to_string();
                    }
                    None => {
                        reason = format!("HTTP {} without Replay-Nonce header", response.status)
                    }
                },
                Err(e) => reason = e.to_string(),
            }
        }
        Err(NonceError::Exhausted { url, reason })
    }

    fn lock(&self) -> Result<MutexGuard<'_, NonceState>> {
        self.state.lock().map_err(|_| NonceError::LockPoisoned)
    }
}

impl NonceT for NonceManager {
    fn acquire(&self) -> Result<String> {
        {
            let mut state = self.lock()?;
            if let Some(nonce) = state.cached.take() {
                if !state.consumed.contains(&nonce) {
                    return Ok(nonce);
                }
            }
        }
        self.fetch()
    }

    fn consume(&self, nonce: &str) {
        if let Ok(mut state) = self.lock() {
            state.mark_consumed(nonce);
        }
    }
}

/// 永遠回傳同一個值的 Nonce 來源，用於單元測試。
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct FixedNonce {
    value: String,
}

#[cfg(test)]
impl FixedNonce {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[cfg(test)]
impl NonceT for FixedNonce {
    fn acquire(&self) -> Result<String> {
        Ok(self.value.clone())
    }

    fn consume(&self, _nonce: &str) {}
}
