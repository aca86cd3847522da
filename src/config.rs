use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{challenge::ChallengeType, key_pair::KeyAlgorithm};

/// Let's Encrypt 正式環境目錄。
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt 測試環境目錄。
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// TLS 憑證驗證模式。
///
/// 關閉驗證只能透過明確指定 [`TlsVerification::InsecureSkipVerify`]，
/// 任何錯誤都不會自動退回不驗證的連線。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVerification {
    #[default]
    Verify,
    /// 僅供測試或 staging 目錄使用。
    InsecureSkipVerify,
}

/// 授權與訂單輪詢的退避參數。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 整個輪詢階段共用的期限。
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(120),
        }
    }
}

/// 用戶端的完整設定。
#[derive(Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    pub terms_agreed: bool,
    pub tls_verification: TlsVerification,
    pub poll: PollConfig,
    pub directory_ttl: Duration,
    pub request_timeout: Duration,
    /// 暫時性網路錯誤的最大嘗試次數（含第一次）。
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub challenge_preference: Vec<ChallengeType>,
    pub key_algorithm: KeyAlgorithm,
    pub cloudflare_token: Option<String>,
    pub http01_webroot: Option<PathBuf>,
}

impl fmt::Debug for AcmeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeConfig")
            .field("directory_url", &self.directory_url)
            .field("terms_agreed", &self.terms_agreed)
            .field("tls_verification", &self.tls_verification)
            .field("poll", &self.poll)
            .field("directory_ttl", &self.directory_ttl)
            .field("request_timeout", &self.request_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("challenge_preference", &self.challenge_preference)
            .field("key_algorithm", &self.key_algorithm)
            .field(
                "cloudflare_token",
                &self.cloudflare_token.as_ref().map(|_| "<redacted>"),
            )
            .field("http01_webroot", &self.http01_webroot)
            .finish()
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            terms_agreed: false,
            tls_verification: TlsVerification::default(),
            poll: PollConfig::default(),
            directory_ttl: Duration::from_secs(60 * 60),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            challenge_preference: vec![
                ChallengeType::Http01,
                ChallengeType::Dns01,
                ChallengeType::TlsAlpn01,
            ],
            key_algorithm: KeyAlgorithm::default(),
            cloudflare_token: None,
            http01_webroot: None,
        }
    }
}

impl AcmeConfig {
    pub fn builder() -> AcmeConfigBuilder {
        AcmeConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if !(self.directory_url.starts_with("https://")
            || self.directory_url.starts_with("http://"))
        {
            return Err(ConfigError::Invalid(format!(
                "directory URL must be http(s): {}",
                self.directory_url
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.poll.initial_delay.is_zero() || self.poll.initial_delay > self.poll.max_delay {
            return Err(ConfigError::Invalid(
                "poll initial delay must be non-zero and not exceed max delay".into(),
            ));
        }
        if self.challenge_preference.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one challenge type is required".into(),
            ));
        }
        for (i, ty) in self.challenge_preference.iter().enumerate() {
            if self.challenge_preference[..i].contains(ty) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate challenge type: {}",
                    ty.as_str()
                )));
            }
        }
        if matches!(&self.cloudflare_token, Some(token) if token.trim().is_empty()) {
            return Err(ConfigError::Invalid("Cloudflare token is empty".into()));
        }
        Ok(())
    }
}

/// [`AcmeConfig`] 的建構器，未設定的欄位使用預設值。
#[derive(Debug, Default)]
pub struct AcmeConfigBuilder {
    config: AcmeConfig,
}

impl AcmeConfigBuilder {
    pub fn directory_url(mut self, url: impl Into<String>) -> Self {
        self.config.directory_url = url.into();
        self
    }

    pub fn terms_agreed(mut self, agreed: bool) -> Self {
        self.config.terms_agreed = agreed;
        self
    }

    /// 關閉 TLS 驗證必須經由此方法明確指定。
    pub fn tls_verification(mut self, mode: TlsVerification) -> Self {
        self.config.tls_verification = mode;
        self
    }

    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.config.poll = poll;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll.timeout = timeout;
        self
    }

    pub fn directory_ttl(mut self, ttl: Duration) -> Self {
        self.config.directory_ttl = ttl;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn challenge_preference(mut self, order: Vec<ChallengeType>) -> Self {
        self.config.challenge_preference = order;
        self
    }

    pub fn key_algorithm(mut self, alg: KeyAlgorithm) -> Self {
        self.config.key_algorithm = alg;
        self
    }

    pub fn cloudflare_token(mut self, token: impl Into<String>) -> Self {
        self.config.cloudflare_token = Some(token.into());
        self
    }

    pub fn http01_webroot(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.http01_webroot = Some(path.into());
        self
    }

    pub fn build(self) -> Result<AcmeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
