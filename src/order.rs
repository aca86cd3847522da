//! 訂單流程：建立訂單、完成每個授權的挑戰、finalize 並下載證書。

use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    account::{Account, AccountStatus},
    certificate::{CertificateChain, CertificateError},
    challenge::{Authorization, AuthorizationStatus, Challenge, ChallengeType},
    client::{location, AcmeClient, RequestError},
    clock::{Backoff, CancelToken},
    csr::{Csr, CsrError},
    key_pair::{KeyAlgorithm, KeyError, KeyPair},
    payload::{
        ChallengeValidationPayload, DeactivatePayload, FinalizeOrderPayload, Identifier,
        NewOrderPayload,
    },
    problem::{describe, Problem},
    solver::{ChallengeSolver, ProofRecord, ProvisionError},
};

/// 等待期間檢查中止標記的間隔。
const ABORT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// 單一網域無法完成驗證的原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceFailure {
    /// 伺服器判定挑戰失敗。
    ChallengeInvalid,
    /// 授權在期限內沒有離開 pending。
    AuthorizationTimedOut,
    /// 授權已是 valid 以外的終止狀態。
    AuthorizationUnusable(AuthorizationStatus),
    /// 沒有任何已設定的解決器支援伺服器提供的挑戰。
    NoSupportedChallenge,
    Prepare(String),
    Trigger(String),
    OrderInvalid,
    OrderTimedOut,
}

impl fmt::Display for IssuanceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChallengeInvalid => write!(f, "challenge was rejected"),
            Self::AuthorizationTimedOut => write!(f, "authorization did not complete in time"),
            Self::AuthorizationUnusable(status) => write!(f, "authorization is {:?}", status),
            Self::NoSupportedChallenge => write!(f, "no configured solver matches the offered challenges"),
            Self::Prepare(e) => write!(f, "failed to publish proof: {}", e),
            Self::Trigger(e) => write!(f, "failed to trigger challenge: {}", e),
            Self::OrderInvalid => write!(f, "order became invalid"),
            Self::OrderTimedOut => write!(f, "order did not complete in time"),
        }
    }
}

fn challenge_suffix(challenge_type: &Option<ChallengeType>) -> String {
    challenge_type
        .map(|t| format!(" ({})", t))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Issuance for {domain}{} failed: {reason}{}", challenge_suffix(.challenge_type), describe(.problem))]
    Issuance {
        domain: String,
        challenge_type: Option<ChallengeType>,
        reason: IssuanceFailure,
        problem: Option<Problem>,
    },
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Order is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: OrderStatus,
        actual: OrderStatus,
    },
    #[error("Order has no certificate URL")]
    MissingCertificate,
    #[error("Account is {0:?}, a valid account is required")]
    AccountNotValid(AccountStatus),
    #[error("Validation worker panicked")]
    WorkerPanicked,
}

impl OrderError {
    /// 伺服器回報的問題文件。
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Self::Issuance { problem, .. } => problem.as_ref(),
            Self::Request(e) => e.problem(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Request(RequestError::Cancelled))
    }

    fn issuance(
        domain: &str,
        challenge_type: Option<ChallengeType>,
        reason: IssuanceFailure,
        problem: Option<Problem>,
    ) -> Self {
        Self::Issuance {
            domain: domain.to_string(),
            challenge_type,
            reason,
            problem,
        }
    }
}

type Result<T> = std::result::Result<T, OrderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// 伺服器上的訂單物件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub identifiers: Vec<Identifier>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
    /// 訂單 URL，取自 `Location` 標頭。
    #[serde(skip)]
    pub url: String,
}

impl Order {
    pub fn domains(&self) -> Vec<&str> {
        self.identifiers.iter().map(|i| i.value.as_str()).collect()
    }
}

/// 簽發完成的證書鏈與其私鑰。
#[derive(Clone)]
pub struct IssuedCertificate {
    pub chain: CertificateChain,
    pub key: KeyPair,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

/// 已發佈、尚待清除的驗證記錄。
///
/// 每筆記錄在發佈前登記，離開作用域時一定會被清除一次。
struct CleanupGuard {
    pending: Vec<(ChallengeSolver, ProofRecord)>,
}

impl CleanupGuard {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn register(&mut self, solver: &ChallengeSolver, record: &ProofRecord) {
        self.pending.push((solver.clone(), record.clone()));
    }

    fn cleanup_all(&mut self) {
        for (solver, record) in self.pending.drain(..) {
            if let Err(e) = solver.cleanup(&record) {
                warn!(domain = record.domain(), kind = record.kind(), error = %e, "Failed to clean up challenge proof");
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

/// 已發佈證明、等待伺服器驗證的授權。
struct Pending<'a> {
    authorization: &'a Authorization,
    challenge_url: String,
    challenge_type: ChallengeType,
}

enum Outcome {
    Valid,
    Aborted,
}

/// 以某個帳戶驅動訂單的各個步驟。
pub struct OrderOrchestrator<'a> {
    client: &'a AcmeClient,
    account: &'a Account,
    solvers: Vec<ChallengeSolver>,
}

impl<'a> OrderOrchestrator<'a> {
    /// # 參數
    ///
    /// - `client`: 已設定目錄與輪詢策略的 [`AcmeClient`]。
    /// - `account`: 下訂單的帳戶，必須為 valid 才能執行 [`Self::issue`]。
    /// - `solvers`: 可用的挑戰解決器，挑戰類型的選擇只會在這些解決器之間進行。
    pub fn new(client: &'a AcmeClient, account: &'a Account, solvers: Vec<ChallengeSolver>) -> Self {
        Self {
            client,
            account,
            solvers,
        }
    }

    fn post_as_get(&self, url: &str) -> Result<crate::http::HttpResponse> {
        Ok(self
            .client
            .post_as_get(self.account.key(), &self.account.account_url, url)?)
    }

    /// 建立新訂單。
    pub fn submit_order<S: AsRef<str>>(&self, domains: &[S]) -> Result<Order> {
        let directory = self.client.directory()?;
        let payload = NewOrderPayload::new(domains);
        let response = self.client.post(
            self.account.key(),
            &self.account.kid(),
            &directory.new_order,
            Some(&payload),
        )?;
        let mut order: Order = response.json()?;
        order.url = location(&response, &directory.new_order)?;
        info!(order = %order.url, domains = ?order.domains(), "Created order");
        Ok(order)
    }

    /// 以 POST-as-GET 重新取得訂單，回傳的訂單 URL 為 `url`。
    pub fn fetch_order(&self, url: &str) -> Result<Order> {
        let mut order: Order = self.post_as_get(url)?.json()?;
        order.url = url.to_string();
        Ok(order)
    }

    /// 取得單一授權。
    pub fn fetch_authorization(&self, url: &str) -> Result<Authorization> {
        let mut authorization: Authorization = self.post_as_get(url)?.json()?;
        authorization.url = url.to_string();
        Ok(authorization)
    }

    /// 依訂單中的順序取得所有授權。
    ///
    /// # 錯誤
    ///
    /// 任一授權取得失敗就回傳該錯誤，不會回傳部分結果。
    pub fn fetch_authorizations(&self, order: &Order) -> Result<Vec<Authorization>> {
        order
            .authorizations
            .iter()
            .map(|url| self.fetch_authorization(url))
            .collect()
    }

    /// 通知伺服器開始驗證挑戰。
    pub fn trigger_challenge(&self, url: &str) -> Result<Challenge> {
        let response = self.client.post(
            self.account.key(),
            &self.account.kid(),
            url,
            Some(&ChallengeValidationPayload::default()),
        )?;
        Ok(response.json()?)
    }

    /// 放棄仍在 pending 的授權。
    pub fn deactivate_authorization(&self, url: &str) -> Result<Authorization> {
        let response = self.client.post(
            self.account.key(),
            &self.account.kid(),
            url,
            Some(&DeactivatePayload::default()),
        )?;
        let mut authorization: Authorization = response.json()?;
        authorization.url = url.to_string();
        Ok(authorization)
    }

    /// 輪詢授權直到離開 pending 或超過 `deadline`。
    pub fn poll_authorization(&self, url: &str, deadline: Instant) -> Result<Authorization> {
        match self.poll_authorization_until(url, deadline, &CancelToken::new())? {
            Some(authorization) => Ok(authorization),
            None => Err(RequestError::Cancelled.into()),
        }
    }

    fn poll_authorization_until(
        &self,
        url: &str,
        deadline: Instant,
        abort: &CancelToken,
    ) -> Result<Option<Authorization>> {
        let poll = &self.client.config().poll;
        let mut backoff = Backoff::new(poll.initial_delay, poll.max_delay);
        loop {
            let authorization = self.fetch_authorization(url)?;
            if authorization.status.is_final() {
                return Ok(Some(authorization));
            }
            let remaining = deadline.saturating_duration_since(self.client.clock().now());
            if remaining.is_zero() {
                return Err(OrderError::issuance(
                    authorization.domain(),
                    None,
                    IssuanceFailure::AuthorizationTimedOut,
                    None,
                ));
            }
            let delay = backoff.next_delay().min(remaining);
            debug!(authorization = %url, delay = ?delay, "Authorization still pending");
            if !self.wait(delay, abort)? {
                return Ok(None);
            }
        }
    }

    /// 送出 CSR。
    ///
    /// # 參數
    ///
    /// - `order`: 狀態為 ready 的訂單。
    /// - `csr_der`: DER 編碼的 CSR，SAN 必須與訂單的識別碼相同。
    ///
    /// # 回傳
    ///
    /// 伺服器回傳的最新訂單，通常為 processing 或 valid。
    pub fn finalize_order(&self, order: &Order, csr_der: &[u8]) -> Result<Order> {
        let response = self.client.post(
            self.account.key(),
            &self.account.kid(),
            &order.finalize,
            Some(&FinalizeOrderPayload::new(csr_der)),
        )?;
        let mut updated: Order = response.json()?;
        updated.url = response
            .location()
            .map(ToString::to_string)
            .unwrap_or_else(|| order.url.clone());
        Ok(updated)
    }

    /// 輪詢訂單直到不再是 pending 或 processing。
    pub fn poll_order(&self, order: &Order) -> Result<Order> {
        let poll = &self.client.config().poll;
        let deadline = self.client.clock().now() + poll.timeout;
        let mut backoff = Backoff::new(poll.initial_delay, poll.max_delay);
        let mut current = order.clone();
        while matches!(current.status, OrderStatus::Pending | OrderStatus::Processing) {
            let response = self.post_as_get(&order.url)?;
            current = response.json()?;
            current.url = order.url.clone();
            if !matches!(current.status, OrderStatus::Pending | OrderStatus::Processing) {
                break;
            }
            let remaining = deadline.saturating_duration_since(self.client.clock().now());
            if remaining.is_zero() {
                return Err(OrderError::issuance(
                    &current.domains().join(", "),
                    None,
                    IssuanceFailure::OrderTimedOut,
                    current.error.clone(),
                ));
            }
            let delay = response
                .retry_after()
                .map(|d| d.min(poll.max_delay))
                .unwrap_or_else(|| backoff.next_delay())
                .min(remaining);
            debug!(order = %order.url, status = ?current.status, delay = ?delay, "Order not finished");
            self.client.pause(delay)?;
        }
        Ok(current)
    }

    /// 下載證書鏈，第一張為終端實體證書。
    ///
    /// # 錯誤
    ///
    /// 訂單尚未帶有證書 URL 時回傳 [`OrderError::MissingCertificate`]。
    pub fn download_certificate(&self, order: &Order) -> Result<CertificateChain> {
        let Some(url) = &order.certificate else {
            return Err(OrderError::MissingCertificate);
        };
        let response = self.post_as_get(url)?;
        Ok(CertificateChain::from_pem(&response.body)?)
    }

    /// 完整簽發流程，回傳證書鏈與新產生的證書私鑰。
    ///
    /// 任何授權失敗都會中止整個訂單。已發佈的驗證記錄在流程結束時一律清除，包含取消的情況。
    ///
    /// # 錯誤
    ///
    /// 帳戶不是 valid 時回傳 [`OrderError::AccountNotValid`]，不會送出任何請求。
    pub fn issue<S: AsRef<str>>(&self, domains: &[S]) -> Result<IssuedCertificate> {
        if self.account.status() != AccountStatus::Valid {
            return Err(OrderError::AccountNotValid(self.account.status()));
        }
        let order = self.submit_order(domains)?;
        let authorizations = self.fetch_authorizations(&order)?;

        let mut guard = CleanupGuard::new();
        let authorized = self.authorize(&authorizations, &mut guard);
        if let Err(e) = &authorized {
            warn!(order = %order.url, error = %e, "Authorization failed, abandoning order");
            self.deactivate_pending(&authorizations);
        }
        guard.cleanup_all();
        authorized?;

        let order = self.poll_order(&order)?;
        self.expect_status(&order, OrderStatus::Ready)?;

        let key = KeyPair::generate(KeyAlgorithm::EcP256)?;
        let csr = Csr::with_domains(&order.domains()).build_der(&key)?;
        let order = self.finalize_order(&order, &csr)?;
        let order = self.poll_order(&order)?;
        self.expect_status(&order, OrderStatus::Valid)?;

        let chain = self.download_certificate(&order)?;
        info!(order = %order.url, certificates = chain.len(), "Certificate issued");
        Ok(IssuedCertificate { chain, key })
    }

    fn expect_status(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        match order.status {
            status if status == expected => Ok(()),
            OrderStatus::Invalid => Err(OrderError::issuance(
                &order.domains().join(", "),
                None,
                IssuanceFailure::OrderInvalid,
                order.error.clone(),
            )),
            actual => Err(OrderError::InvalidState { expected, actual }),
        }
    }

    /// 依設定的偏好順序，在已有解決器的類型中挑選挑戰。
    fn select<'b>(&self, authorization: &'b Authorization) -> Option<(&ChallengeSolver, &'b Challenge)> {
        let preference: Vec<ChallengeType> = self
            .client
            .config()
            .challenge_preference
            .iter()
            .copied()
            .filter(|t| self.solvers.iter().any(|s| s.challenge_type() == *t))
            .collect();
        let (kind, challenge) = authorization.select_challenge(&preference)?;
        let solver = self.solvers.iter().find(|s| s.challenge_type() == kind)?;
        Some((solver, challenge))
    }

    /// 發佈所有證明，再並行觸發並輪詢各授權。
    fn authorize(&self, authorizations: &[Authorization], guard: &mut CleanupGuard) -> Result<()> {
        let thumbprint = self.account.key().thumbprint()?;
        let mut pending = Vec::new();
        for authorization in authorizations {
            let domain = authorization.domain();
            match authorization.status {
                AuthorizationStatus::Valid => {
                    debug!(domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(OrderError::issuance(
                        domain,
                        None,
                        IssuanceFailure::AuthorizationUnusable(status),
                        authorization.failure().cloned(),
                    ))
                }
            }

            let Some((solver, challenge)) = self.select(authorization) else {
                return Err(OrderError::issuance(
                    domain,
                    None,
                    IssuanceFailure::NoSupportedChallenge,
                    None,
                ));
            };
            let kind = solver.challenge_type();
            let prepare_error =
                |e: ProvisionError| OrderError::issuance(domain, Some(kind), IssuanceFailure::Prepare(e.to_string()), None);
            let record = solver.proof(domain, challenge, &thumbprint).map_err(prepare_error)?;
            guard.register(solver, &record);
            solver.prepare(&record).map_err(prepare_error)?;
            pending.push(Pending {
                authorization,
                challenge_url: challenge.url.clone(),
                challenge_type: kind,
            });
        }

        let deadline = self.client.clock().now() + self.client.config().poll.timeout;
        let abort = CancelToken::new();
        let results: Vec<Result<Outcome>> = thread::scope(|s| {
            let workers: Vec<_> = pending
                .iter()
                .map(|p| {
                    let abort = &abort;
                    s.spawn(move || {
                        let result = self.validate(p, deadline, abort);
                        if result.is_err() {
                            abort.cancel();
                        }
                        result
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or(Err(OrderError::WorkerPanicked)))
                .collect()
        });

        results.into_iter().try_for_each(|r| r.map(drop))
    }

    /// 觸發單一挑戰並等待其授權的結果。
    fn validate(&self, pending: &Pending<'_>, deadline: Instant, abort: &CancelToken) -> Result<Outcome> {
        let domain = pending.authorization.domain();
        let kind = Some(pending.challenge_type);
        if let Err(e) = self.trigger_challenge(&pending.challenge_url) {
            return Err(match e {
                OrderError::Request(RequestError::Cancelled) => e,
                e => {
                    let problem = e.problem().cloned();
                    OrderError::issuance(domain, kind, IssuanceFailure::Trigger(e.to_string()), problem)
                }
            });
        }
        debug!(domain, challenge = %pending.challenge_type, "Challenge triggered");

        let polled = self.poll_authorization_until(&pending.authorization.url, deadline, abort);
        let authorization = match polled {
            Ok(Some(authorization)) => authorization,
            Ok(None) => return Ok(Outcome::Aborted),
            Err(OrderError::Issuance { reason, .. }) => {
                return Err(OrderError::issuance(domain, kind, reason, None))
            }
            Err(e) => return Err(e),
        };
        match authorization.status {
            AuthorizationStatus::Valid => {
                info!(domain, challenge = %pending.challenge_type, "Authorization valid");
                Ok(Outcome::Valid)
            }
            AuthorizationStatus::Invalid => Err(OrderError::issuance(
                domain,
                kind,
                IssuanceFailure::ChallengeInvalid,
                authorization.failure().cloned(),
            )),
            status => Err(OrderError::issuance(
                domain,
                kind,
                IssuanceFailure::AuthorizationUnusable(status),
                authorization.failure().cloned(),
            )),
        }
    }

    /// 等待 `delay`，中止時回傳 `false`；呼叫端取消則回傳錯誤。
    fn wait(&self, delay: Duration, abort: &CancelToken) -> Result<bool> {
        let clock = self.client.clock();
        let until = clock.now() + delay;
        loop {
            if abort.is_cancelled() {
                return Ok(false);
            }
            let remaining = until.saturating_duration_since(clock.now());
            if remaining.is_zero() {
                return Ok(true);
            }
            self.client.pause(remaining.min(ABORT_CHECK_INTERVAL))?;
        }
    }

    /// 盡力停用仍在 pending 的授權，讓伺服器端的訂單結束。
    fn deactivate_pending(&self, authorizations: &[Authorization]) {
        for authorization in authorizations {
            if authorization.status != AuthorizationStatus::Pending {
                continue;
            }
            let current = match self.fetch_authorization(&authorization.url) {
                Ok(current) => current,
                Err(e) => {
                    warn!(domain = authorization.domain(), error = %e, "Failed to fetch authorization");
                    continue;
                }
            };
            if current.status != AuthorizationStatus::Pending {
                continue;
            }
            match self.deactivate_authorization(&authorization.url) {
                Ok(_) => info!(domain = authorization.domain(), "Deactivated pending authorization"),
                Err(e) => warn!(domain = authorization.domain(), error = %e, "Failed to deactivate authorization"),
            }
        }
    }
}
