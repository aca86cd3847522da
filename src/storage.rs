//! 帳戶記錄的持久化邊界。
//!
//! 核心只透過 [`AccountStore`] 讀寫帳戶記錄，並以帳戶 URL 作為唯一鍵進行原子 upsert。

use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::{base64::Base64, key_pair::KeyRecord};

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to persist record: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// 伺服器指派的註冊資源：帳戶 URL 與最後一次取得的帳戶物件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResource {
    pub uri: String,
    pub body: Value,
}

/// 一筆持久化的帳戶記錄。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub name: String,
    pub email: String,
    /// ACME 目錄 URL。
    pub ca_dir: String,
    pub registration: RegistrationResource,
    pub key: KeyRecord,
}

impl AccountRecord {
    fn validate(&self) -> Result<()> {
        if self.registration.uri.trim().is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "account {} has no registration URI",
                self.email
            )));
        }
        Ok(())
    }

    fn matches(&self, email: &str, directory_url: &str) -> bool {
        self.email.eq_ignore_ascii_case(email) && self.ca_dir == directory_url
    }

    /// 記錄中的帳戶狀態已停用或撤銷。
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.registration.body.get("status").and_then(Value::as_str),
            Some("deactivated" | "revoked")
        )
    }
}

/// 同一 email 與目錄可能留有被取代的舊記錄，優先回傳仍可使用的那筆。
fn prefer_usable(matches: impl IntoIterator<Item = AccountRecord>) -> Option<AccountRecord> {
    let mut fallback = None;
    for record in matches {
        if !record.is_terminal() {
            return Some(record);
        }
        fallback.get_or_insert(record);
    }
    fallback
}

/// 帳戶記錄的儲存協作者。
pub trait AccountStore: Send + Sync + fmt::Debug {
    fn load(&self, account_url: &str) -> Result<Option<AccountRecord>>;
    /// 依 email（不分大小寫）與目錄 URL 查找記錄。
    ///
    /// 同時有多筆時優先回傳尚未停用或撤銷的記錄。
    fn find_by_email(&self, email: &str, directory_url: &str) -> Result<Option<AccountRecord>>;
    /// 以 `registration.uri` 為鍵原子地新增或取代記錄。
    fn upsert(&self, record: &AccountRecord) -> Result<()>;
}

/// 記憶體內的 [`AccountStore`]。
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, AccountRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目前保存的記錄數。
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AccountStore for MemoryStore {
    fn load(&self, account_url: &str) -> Result<Option<AccountRecord>> {
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.get(account_url).cloned())
    }

    fn find_by_email(&self, email: &str, directory_url: &str) -> Result<Option<AccountRecord>> {
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(prefer_usable(
            records
                .values()
                .filter(|r| r.matches(email, directory_url))
                .cloned(),
        ))
    }

    fn upsert(&self, record: &AccountRecord) -> Result<()> {
        record.validate()?;
        self.records
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(record.registration.uri.clone(), record.clone());
        Ok(())
    }
}

/// 每個帳戶一個 JSON 檔的 [`AccountStore`]。
///
/// 檔名為帳戶 URL 的 URL 安全 Base64；寫入先落在同目錄的暫存檔再 rename，
/// 讀取端永遠看不到寫到一半的記錄。Unix 上檔案權限為 `0600`。
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    const EXTENSION: &'static str = "json";

    /// 開啟（必要時建立）儲存目錄。
    ///
    /// # 錯誤
    ///
    /// 無法建立目錄或設定權限時回傳 [`StorageError::Io`]。
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self { root })
    }

    fn path_for(&self, account_url: &str) -> PathBuf {
        self.root.join(format!(
            "{}.{}",
            Base64::new(account_url).base64_url(),
            Self::EXTENSION
        ))
    }

    fn read(path: &Path) -> Result<Option<AccountRecord>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl AccountStore for FileStore {
    fn load(&self, account_url: &str) -> Result<Option<AccountRecord>> {
        Self::read(&self.path_for(account_url))
    }

    fn find_by_email(&self, email: &str, directory_url: &str) -> Result<Option<AccountRecord>> {
        let mut matches = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(Self::EXTENSION) {
                continue;
            }
            if let Some(record) = Self::read(&path)? {
                if record.matches(email, directory_url) {
                    matches.push(record);
                }
            }
        }
        Ok(prefer_usable(matches))
    }

    fn upsert(&self, record: &AccountRecord) -> Result<()> {
        record.validate()?;
        let mut file = NamedTempFile::new_in(&self.root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        serde_json::to_writer_pretty(&mut file, record)?;
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(self.path_for(&record.registration.uri))?;
        Ok(())
    }
}
