use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    clock::Clock,
    http::{HttpClient, HttpError},
};

/// 取得目錄時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Network error fetching directory: {0}")]
    Network(#[from] HttpError),
    #[error("Directory {url} returned HTTP {status}")]
    Unavailable { url: String, status: u16 },
    #[error("Malformed directory at {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("Lock poisoned")]
    LockPoisoned,
}

impl DirectoryError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => e.is_transient(),
            Self::Unavailable { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, DirectoryError>;

/// ACME 伺服器公布的端點清單（RFC 8555 §7.1.1）。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Directory {
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
    #[serde(rename = "newAuthz", default, skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,
    #[serde(rename = "revokeCert")]
    pub revoke_cert: String,
    #[serde(rename = "keyChange")]
    pub key_change: String,
    /// 可能不存在。
    #[serde(rename = "renewalInfo", default, skip_serializing_if = "Option::is_none")]
    pub renewal_info: Option<String>,
    #[serde(default)]
    pub meta: DirectoryMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DirectoryMeta {
    #[serde(rename = "termsOfService", default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(rename = "caaIdentities", default, skip_serializing_if = "Vec::is_empty")]
    pub caa_identities: Vec<String>,
    #[serde(rename = "externalAccountRequired", default)]
    pub external_account_required: bool,
}

impl Directory {
    /// 解析並檢查必要端點皆存在。
    pub fn parse(url: &str, body: &[u8]) -> Result<Self> {
        let directory: Directory =
            serde_json::from_slice(body).map_err(|e| DirectoryError::Malformed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let required = [
            ("newNonce", &directory.new_nonce),
            ("newAccount", &directory.new_account),
            ("newOrder", &directory.new_order),
            ("revokeCert", &directory.revoke_cert),
            ("keyChange", &directory.key_change),
        ];
        for (name, endpoint) in required {
            if endpoint.trim().is_empty() {
                return Err(DirectoryError::Malformed {
                    url: url.to_string(),
                    reason: format!("empty {} endpoint", name),
                });
            }
        }
        Ok(directory)
    }
}

enum Entry {
    Fetching,
    Cached {
        directory: Arc<Directory>,
        fetched_at: Instant,
    },
}

/// 依目錄 URL 快取 [`Directory`]，可在多個帳戶之間共享。
///
/// 同一個 URL 的並行解析只會觸發一次網路請求，其餘呼叫者等待該次結果。
#[derive(Debug)]
pub struct DirectoryResolver {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    ready: Condvar,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetching => f.write_str("Fetching"),
            Self::Cached { fetched_at, .. } => {
                f.debug_struct("Cached").field("fetched_at", fetched_at).finish()
            }
        }
    }
}

impl DirectoryResolver {
    pub fn new(http: Arc<dyn HttpClient>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            http,
            clock,
            ttl,
            entries: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    /// 取得目錄，TTL 內直接回傳快取。
    pub fn resolve(&self, url: &str) -> Result<Arc<Directory>> {
        let mut entries = self.lock()?;
        loop {
            match entries.get(url) {
                Some(Entry::Cached {
                    directory,
                    fetched_at,
                }) if self.clock.now().saturating_duration_since(*fetched_at) < self.ttl => {
                    return Ok(Arc::clone(directory));
                }
                Some(Entry::Fetching) => {
                    entries = self
                        .ready
                        .wait(entries)
                        .map_err(|_| DirectoryError::LockPoisoned)?;
                }
                _ => break,
            }
        }
        entries.insert(url.to_string(), Entry::Fetching);
        drop(entries);

        let mut slot = FetchSlot {
            resolver: self,
            url,
            directory: None,
        };
        let directory = Arc::new(self.fetch(url)?);
        slot.directory = Some(Arc::clone(&directory));
        Ok(directory)
    }

    /// 丟棄快取，下次 `resolve` 會重新抓取。進行中的抓取不受影響。
    pub fn invalidate(&self, url: &str) -> Result<()> {
        let mut entries = self.lock()?;
        if matches!(entries.get(url), Some(Entry::Cached { .. })) {
            entries.remove(url);
        }
        Ok(())
    }

    fn fetch(&self, url: &str) -> Result<Directory> {
        debug!(url = %url, "Fetching ACME directory");
        let response = self.http.get(url)?;
        if !response.is_success() {
            return Err(DirectoryError::Unavailable {
                url: url.to_string(),
                status: response.status,
            });
        }
        Directory::parse(url, &response.body)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| DirectoryError::LockPoisoned)
    }
}

/// 進行中的抓取佔位。離開時（成功、錯誤或 panic）寫回結果並喚醒等待者。
struct FetchSlot<'a> {
    resolver: &'a DirectoryResolver,
    url: &'a str,
    directory: Option<Arc<Directory>>,
}

impl Drop for FetchSlot<'_> {
    fn drop(&mut self) {
        let resolver = self.resolver;
        let mut entries = resolver
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match self.directory.take() {
            Some(directory) => {
                entries.insert(
                    self.url.to_string(),
                    Entry::Cached {
                        directory,
                        fetched_at: resolver.clock.now(),
                    },
                );
            }
            None => {
                entries.remove(self.url);
            }
        }
        drop(entries);
        resolver.ready.notify_all();
    }
}
