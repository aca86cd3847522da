//! ACME 帳戶：註冊、更新、停用、金鑰輪替與持久化。

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    certificate::{Certificate, CertificateError},
    client::{location, AcmeClient, RequestError},
    jwk::{Jwk, JwkError},
    jws::{Jws, JwsError},
    key_pair::{KeyError, KeyPair},
    payload::{
        AccountUpdatePayload, DeactivatePayload, KeyChangePayload, NewAccountPayload,
        RevokeCertPayload,
    },
    problem::{describe, Problem, ProblemKind},
    protection::{KeyMode, ProtectedHeader, ProtectionError},
    storage::{AccountRecord, AccountStore, RegistrationResource, StorageError},
};

/// 帳戶狀態（RFC 8555 §7.1.6）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Pending,
    Valid,
    Deactivated,
    Revoked,
}

impl AccountStatus {
    /// 停用或撤銷後不會再改變。
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deactivated | Self::Revoked)
    }

    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        match (*self, next) {
            (from, to) if from == to => true,
            (Self::Pending, _) => true,
            (Self::Valid, Self::Deactivated | Self::Revoked) => true,
            _ => false,
        }
    }
}

/// 註冊失敗的原因，由伺服器問題文件的類型對應而來。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationReason {
    #[error("user action required{}", at_instance(.instance))]
    UserActionRequired { instance: Option<String> },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("external account binding required")]
    ExternalAccountRequired,
    #[error("invalid contact")]
    InvalidContact,
    #[error("unsupported contact")]
    UnsupportedContact,
    #[error("unauthorized")]
    Unauthorized,
    #[error("account does not exist")]
    AccountDoesNotExist,
    #[error("terms of service not agreed")]
    TermsNotAgreed,
    #[error("server response has no account URL")]
    MissingLocation,
    #[error("server rejected registration with {problem_type}")]
    Other { problem_type: String },
}

fn at_instance(instance: &Option<String>) -> String {
    instance
        .as_ref()
        .map(|i| format!(" at {}", i))
        .unwrap_or_default()
}

impl RegistrationReason {
    fn from_problem(problem: &Problem, retry_after: Option<Duration>) -> Self {
        match problem.kind() {
            ProblemKind::UserActionRequired => Self::UserActionRequired {
                instance: problem.instance.clone(),
            },
            ProblemKind::RateLimited => Self::RateLimited { retry_after },
            ProblemKind::ExternalAccountRequired => Self::ExternalAccountRequired,
            ProblemKind::InvalidContact => Self::InvalidContact,
            ProblemKind::UnsupportedContact => Self::UnsupportedContact,
            ProblemKind::Unauthorized => Self::Unauthorized,
            ProblemKind::AccountDoesNotExist => Self::AccountDoesNotExist,
            _ => Self::Other {
                problem_type: problem.problem_type.clone(),
            },
        }
    }

    /// 等待伺服器指定的時間後可以重試。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Registration of {email} failed: {reason}{}", describe(.problem))]
    Registration {
        email: String,
        reason: RegistrationReason,
        problem: Option<Problem>,
    },
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("Protection error: {0}")]
    Protection(#[from] ProtectionError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid account status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: AccountStatus,
        to: AccountStatus,
    },
    #[error("Account is {0:?}, a valid account is required")]
    NotValid(AccountStatus),
}

pub type Result<T> = std::result::Result<T, AccountError>;

/// 伺服器上的一個帳戶與其簽名金鑰。
///
/// 帳戶成為 `valid` 後，金鑰只能透過 [`AccountClient::key_rollover`] 更換。
#[derive(Clone)]
pub struct Account {
    pub email: String,
    pub directory_url: String,
    pub account_url: String,
    pub contact: Vec<String>,
    status: AccountStatus,
    key: KeyPair,
    body: Value,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("email", &self.email)
            .field("directory_url", &self.directory_url)
            .field("account_url", &self.account_url)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Account {
    /// 最後一次從伺服器得知的帳戶狀態。
    pub fn status(&self) -> AccountStatus {
        self.status
    }

    /// 帳戶金鑰，金鑰輪替後為新金鑰。
    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    /// 最後一次取得的帳戶物件。
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub(crate) fn kid(&self) -> KeyMode {
        KeyMode::Kid(self.account_url.clone())
    }

    /// 以伺服器回傳的帳戶物件更新狀態與聯絡資訊。
    fn apply(&mut self, body: Value) -> Result<()> {
        if let Some(status) = body.get("status") {
            let next: AccountStatus = serde_json::from_value(status.clone())?;
            if !self.status.can_transition_to(next) {
                return Err(AccountError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }
        if let Some(contact) = body.get("contact") {
            self.contact = serde_json::from_value(contact.clone()).unwrap_or_default();
        }
        self.body = body;
        Ok(())
    }

    /// 轉成可交給 [`AccountStore`] 保存的記錄，包含私鑰。
    ///
    /// # 參數
    ///
    /// - `name`: 記錄名稱，同一 email 可保存多筆時用於區分。
    ///
    /// # 錯誤
    ///
    /// 匯出金鑰失敗時回傳 [`AccountError`]。
    pub fn to_record(&self, name: &str) -> Result<AccountRecord> {
        Ok(AccountRecord {
            name: name.to_string(),
            email: self.email.clone(),
            ca_dir: self.directory_url.clone(),
            registration: RegistrationResource {
                uri: self.account_url.clone(),
                body: self.body.clone(),
            },
            key: self.key.to_record()?,
        })
    }

    /// 從持久化記錄還原；記錄中沒有狀態時視為 `valid`。
    pub fn from_record(record: &AccountRecord) -> Result<Self> {
        let body = &record.registration.body;
        let status = match body.get("status") {
            Some(status) => serde_json::from_value(status.clone())?,
            None => AccountStatus::Valid,
        };
        let contact = body
            .get("contact")
            .and_then(|c| serde_json::from_value(c.clone()).ok())
            .unwrap_or_default();
        Ok(Self {
            email: record.email.clone(),
            directory_url: record.ca_dir.clone(),
            account_url: record.registration.uri.clone(),
            contact,
            status,
            key: KeyPair::from_record(&record.key)?,
            body: body.clone(),
        })
    }
}

/// 帳戶相關的 ACME 操作。
pub struct AccountClient<'a> {
    client: &'a AcmeClient,
}

impl<'a> AccountClient<'a> {
    pub fn new(client: &'a AcmeClient) -> Self {
        Self { client }
    }

    /// 產生新金鑰並註冊。
    pub fn register(&self, email: &str, terms_agreed: bool) -> Result<Account> {
        let key = KeyPair::generate(self.client.config().key_algorithm)?;
        self.register_with_key(email, terms_agreed, key)
    }

    /// 以既有金鑰註冊。
    ///
    /// 伺服器對已註冊過的金鑰回應 200 並帶回同一個帳戶 URL，視為成功。
    ///
    /// # 參數
    ///
    /// - `email`: 帳戶聯絡信箱，送出時加上 `mailto:`。
    /// - `terms_agreed`: 是否同意服務條款，目錄要求同意時必須為 `true`。
    /// - `key`: 帳戶金鑰，註冊後由回傳的 [`Account`] 持有。
    ///
    /// # 錯誤
    ///
    /// 伺服器拒絕時回傳 [`AccountError::Registration`]，並以 [`RegistrationReason`]
    /// 區分條款、聯絡資訊、外部帳戶綁定等原因；網路或簽名失敗則回傳對應的變體。
    pub fn register_with_key(&self, email: &str, terms_agreed: bool, key: KeyPair) -> Result<Account> {
        let directory = self.client.directory()?;
        let reject = |reason: RegistrationReason| AccountError::Registration {
            email: email.to_string(),
            reason,
            problem: None,
        };
        if directory.meta.terms_of_service.is_some() && !terms_agreed {
            return Err(reject(RegistrationReason::TermsNotAgreed));
        }
        if directory.meta.external_account_required {
            return Err(reject(RegistrationReason::ExternalAccountRequired));
        }

        let mode = KeyMode::Jwk(Jwk::new(&key)?);
        let payload = NewAccountPayload::new(email, terms_agreed);
        let response = self
            .client
            .post(&key, &mode, &directory.new_account, Some(&payload))
            .map_err(|e| registration_failure(email, e))?;
        let account_url = location(&response, &directory.new_account)
            .map_err(|_| reject(RegistrationReason::MissingLocation))?;
        let created = response.status == 201;

        let mut account = Account {
            email: email.to_string(),
            directory_url: self.client.config().directory_url.clone(),
            account_url,
            contact: Vec::new(),
            status: AccountStatus::Pending,
            key,
            body: Value::Null,
        };
        account.apply(response.json()?)?;
        info!(
            email = %email,
            account_url = %account.account_url,
            created,
            status = ?account.status,
            "ACME account registered"
        );
        Ok(account)
    }

    /// 更新聯絡資訊。
    pub fn update(&self, account: &mut Account, patch: &AccountUpdatePayload) -> Result<()> {
        let response = self.client.post(
            &account.key,
            &account.kid(),
            &account.account_url,
            Some(patch),
        )?;
        account.apply(response.json()?)
    }

    /// 停用帳戶，之後的任何請求都會被拒絕。
    ///
    /// # 錯誤
    ///
    /// 帳戶已停用或已撤銷時回傳 [`AccountError::InvalidTransition`]，不會送出請求。
    pub fn deactivate(&self, account: &mut Account) -> Result<()> {
        if account.status.is_terminal() {
            return Err(AccountError::InvalidTransition {
                from: account.status,
                to: AccountStatus::Deactivated,
            });
        }
        let response = self.client.post(
            &account.key,
            &account.kid(),
            &account.account_url,
            Some(&DeactivatePayload::default()),
        )?;
        account.apply(response.json()?)?;
        info!(account_url = %account.account_url, "ACME account deactivated");
        Ok(())
    }

    /// 重新取得帳戶物件，可發現伺服器端的撤銷。
    pub fn fetch(&self, account: &mut Account) -> Result<()> {
        let response = self
            .client
            .post_as_get(&account.key, &account.account_url, &account.account_url)?;
        account.apply(response.json()?)
    }

    /// 以 keyChange 把帳戶金鑰換成 `new_key`（RFC 8555 §7.3.5）。
    ///
    /// 內層 JWS 以新金鑰簽名且不帶 nonce，外層以舊金鑰的 kid 模式簽名。
    /// 成功後呼叫端需要重新保存帳戶記錄。
    pub fn key_rollover(&self, account: &mut Account, new_key: KeyPair) -> Result<()> {
        if account.status != AccountStatus::Valid {
            return Err(AccountError::NotValid(account.status));
        }
        let directory = self.client.directory()?;
        let header =
            ProtectedHeader::without_nonce(new_key.jws_alg(), &directory.key_change, &Jwk::new(&new_key)?)?;
        let payload = KeyChangePayload {
            account: account.account_url.clone(),
            old_key: Jwk::new(&account.key)?.to_value()?,
        };
        let inner = Jws::sign(&header, Some(&payload), &new_key)?;
        let response = self.client.post(
            &account.key,
            &account.kid(),
            &directory.key_change,
            Some(&inner),
        )?;

        account.key = new_key;
        if !response.body.is_empty() {
            account.apply(response.json()?)?;
        }
        info!(account_url = %account.account_url, "ACME account key rolled over");
        Ok(())
    }

    /// 以帳戶金鑰撤銷證書，`reason` 為 RFC 5280 原因代碼。
    pub fn revoke_certificate(
        &self,
        account: &Account,
        certificate: &Certificate,
        reason: Option<u8>,
    ) -> Result<()> {
        let directory = self.client.directory()?;
        let payload = RevokeCertPayload::new(&certificate.to_der()?, reason);
        self.client.post(
            &account.key,
            &account.kid(),
            &directory.revoke_cert,
            Some(&payload),
        )?;
        info!(account_url = %account.account_url, names = ?certificate.dns_names(), "Certificate revoked");
        Ok(())
    }
}

fn registration_failure(email: &str, error: RequestError) -> AccountError {
    match error {
        RequestError::Server {
            problem: Some(problem),
            retry_after,
            ..
        } => AccountError::Registration {
            email: email.to_string(),
            reason: RegistrationReason::from_problem(&problem, retry_after),
            problem: Some(problem),
        },
        RequestError::Jws(JwsError::Payload(_)) => AccountError::Registration {
            email: email.to_string(),
            reason: RegistrationReason::InvalidContact,
            problem: None,
        },
        other => AccountError::Request(other),
    }
}

/// 取得或建立一個持久化的帳戶。
///
/// 先依 email 與目錄 URL 在 [`AccountStore`] 中尋找；找到且未停用時直接使用，
/// 否則註冊新帳戶並寫回儲存。
pub struct AccountBuilder<'a> {
    client: &'a AcmeClient,
    store: &'a dyn AccountStore,
    email: String,
    name: String,
    key: Option<KeyPair>,
}

impl<'a> AccountBuilder<'a> {
    const DEFAULT_NAME: &'static str = "default";

    /// # 參數
    ///
    /// - `client`: 送出註冊請求的 [`AcmeClient`]，其目錄 URL 也是查找記錄的條件。
    /// - `store`: 帳戶記錄的儲存位置。
    /// - `email`: 帳戶信箱，查找時不分大小寫。
    pub fn new(client: &'a AcmeClient, store: &'a dyn AccountStore, email: &str) -> Self {
        Self {
            client,
            store,
            email: email.to_string(),
            name: Self::DEFAULT_NAME.to_string(),
            key: None,
        }
    }

    /// 記錄名稱。
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// 註冊時使用指定金鑰而非新產生的。
    pub fn key(mut self, key: KeyPair) -> Self {
        self.key = Some(key);
        self
    }

    /// 取得可用的帳戶：
    ///
    /// * 儲存中有同一 email 與目錄、且尚未停用或撤銷的記錄時直接還原
    /// * 否則註冊新帳戶並寫回儲存
    ///
    /// # 回傳
    ///
    /// 回傳狀態非終止的 [`Account`]。
    ///
    /// # 錯誤
    ///
    /// 讀寫儲存、還原金鑰或註冊失敗時回傳 [`AccountError`]。
    pub fn build(self) -> Result<Account> {
        let config = self.client.config();
        if let Some(record) = self.store.find_by_email(&self.email, &config.directory_url)? {
            let account = Account::from_record(&record)?;
            if !account.status().is_terminal() {
                debug!(email = %self.email, account_url = %account.account_url, "Using stored ACME account");
                return Ok(account);
            }
            info!(
                email = %self.email,
                status = ?account.status(),
                "Stored ACME account is no longer usable, registering a new one"
            );
        }

        let accounts = AccountClient::new(self.client);
        let account = match self.key {
            Some(key) => accounts.register_with_key(&self.email, config.terms_agreed, key)?,
            None => accounts.register(&self.email, config.terms_agreed)?,
        };
        self.store.upsert(&account.to_record(&self.name)?)?;
        Ok(account)
    }
}
