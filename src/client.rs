//! 簽名並送出 ACME 請求的共用層：nonce 擷取、badNonce 重送與暫時性錯誤的退避重試。

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    clock::{sleep_with_cancel, Backoff, CancelToken, Clock, SystemClock},
    config::AcmeConfig,
    directory::{Directory, DirectoryError, DirectoryResolver},
    http::{HttpClient, HttpError, HttpResponse, ReqwestClient},
    jws::{JwsError, JwsSigner},
    key_pair::KeyPair,
    nonce::{NonceError, NonceManager},
    payload::{PayloadError, PayloadT},
    problem::{describe, Problem, ProblemKind},
    protection::{KeyMode, ProtectionError},
};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Network error: {0}")]
    Network(#[from] HttpError),
    #[error("{url} returned HTTP {status}{}", describe(.problem))]
    Server {
        url: String,
        status: u16,
        problem: Option<Problem>,
        retry_after: Option<Duration>,
    },
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Missing Location header in response from {0}")]
    MissingLocation(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl RequestError {
    /// 是否值得以退避重試。
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => e.is_transient(),
            Self::Server { status, .. } => *status >= 500,
            Self::Directory(e) => e.is_transient(),
            Self::Nonce(NonceError::Exhausted { .. }) => true,
            Self::Jws(JwsError::Protection(ProtectionError::Nonce(NonceError::Exhausted {
                ..
            }))) => true,
            _ => false,
        }
    }

    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Self::Server { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, RequestError>;

/// POST-as-GET 時用於型別推斷；不會被序列化。
impl PayloadT for Value {
    fn validate(&self) -> std::result::Result<(), PayloadError> {
        Ok(())
    }
}

/// 一個 ACME 伺服器的工作階段：目錄、nonce 與網路邊界。
#[derive(Debug)]
pub struct AcmeClient {
    config: AcmeConfig,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    resolver: Arc<DirectoryResolver>,
    nonces: NonceManager,
    cancel: CancelToken,
}

impl AcmeClient {
    /// 以 reqwest 與系統時鐘建立用戶端，並立即解析目錄。
    pub fn new(config: AcmeConfig) -> Result<Self> {
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::from_config(&config)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let resolver = Arc::new(DirectoryResolver::new(
            Arc::clone(&http),
            Arc::clone(&clock),
            config.directory_ttl,
        ));
        Self::with_parts(config, http, clock, resolver)
    }

    /// 注入網路、時鐘與共享的目錄快取。
    pub fn with_parts(
        config: AcmeConfig,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        resolver: Arc<DirectoryResolver>,
    ) -> Result<Self> {
        let directory = resolver.resolve(&config.directory_url)?;
        let nonces = NonceManager::new(Arc::clone(&http), directory.new_nonce.clone());
        Ok(Self {
            config,
            http,
            clock,
            resolver,
            nonces,
            cancel: CancelToken::new(),
        })
    }

    /// 由呼叫端提供的取消標記，所有等待與請求前都會檢查。
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    /// 目前的目錄；快取過期時重新取得。
    pub fn directory(&self) -> Result<Arc<Directory>> {
        let directory = self.resolver.resolve(&self.config.directory_url)?;
        self.nonces.retarget(&directory.new_nonce)?;
        Ok(directory)
    }

    /// 丟棄快取並重新取得目錄。
    pub fn refresh_directory(&self) -> Result<Arc<Directory>> {
        self.resolver.invalidate(&self.config.directory_url)?;
        self.directory()
    }

    /// 簽名並送出請求。
    ///
    /// 每次嘗試都使用新的 nonce。伺服器回報 `badNonce` 時立即重送一次；
    /// 暫時性錯誤依 `max_attempts` 以指數退避重試，並尊重 `Retry-After`。
    pub fn post<P: PayloadT>(
        &self,
        key: &KeyPair,
        mode: &KeyMode,
        url: &str,
        payload: Option<&P>,
    ) -> Result<HttpResponse> {
        let mut attempt = 0;
        let mut nonce_retried = false;
        let mut backoff = Backoff::new(self.config.retry_delay, self.config.poll.max_delay);
        loop {
            self.check_cancelled()?;
            attempt += 1;
            let err = match self.send(key, mode, url, payload) {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    let problem = response.problem();
                    if !nonce_retried && problem.as_ref().is_some_and(|p| p.is(ProblemKind::BadNonce)) {
                        nonce_retried = true;
                        debug!(url = %url, "Server rejected nonce, retrying with a fresh one");
                        continue;
                    }
                    if response.status == 410 {
                        if let Err(e) = self.refresh_directory() {
                            warn!(error = %e, "Failed to refresh directory after 410 Gone");
                        }
                    }
                    RequestError::Server {
                        url: url.to_string(),
                        status: response.status,
                        problem,
                        retry_after: response.retry_after(),
                    }
                }
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.config.max_attempts {
                return Err(err);
            }
            let delay = match &err {
                RequestError::Server {
                    retry_after: Some(after),
                    ..
                } => (*after).min(self.config.poll.max_delay),
                _ => backoff.next_delay(),
            };
            warn!(url = %url, attempt, delay = ?delay, error = %err, "Transient ACME request failure, retrying");
            self.pause(delay)?;
        }
    }

    /// 單次嘗試：取 nonce、簽名、送出並記下回應的 nonce。
    fn send<P: PayloadT>(
        &self,
        key: &KeyPair,
        mode: &KeyMode,
        url: &str,
        payload: Option<&P>,
    ) -> Result<HttpResponse> {
        let body = JwsSigner::new(&self.nonces, key)
            .sign(mode, url, payload)?
            .to_json()?;
        let response = self.http.post_jose(url, body)?;
        self.nonces.observe(&response);
        Ok(response)
    }

    /// POST-as-GET（空載荷）。
    pub fn post_as_get(&self, key: &KeyPair, account_url: &str, url: &str) -> Result<HttpResponse> {
        self.post::<Value>(key, &KeyMode::Kid(account_url.to_string()), url, None)
    }

    /// 等待 `delay`；被取消時回傳 [`RequestError::Cancelled`]。
    pub fn pause(&self, delay: Duration) -> Result<()> {
        if sleep_with_cancel(self.clock.as_ref(), delay, &self.cancel) {
            Ok(())
        } else {
            Err(RequestError::Cancelled)
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(RequestError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// 取得 `Location` 標頭。
pub(crate) fn location(response: &HttpResponse, url: &str) -> Result<String> {
    response
        .location()
        .map(ToString::to_string)
        .ok_or_else(|| RequestError::MissingLocation(url.to_string()))
}
