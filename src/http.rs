//! 網路邊界：所有對 ACME 伺服器的 HTTP 往返都經過 [`HttpClient`]。

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{
    blocking::{Client, Response},
    header::CONTENT_TYPE,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::{
    config::{AcmeConfig, TlsVerification},
    problem::Problem,
};

pub const JOSE_CONTENT_TYPE: &str = "application/jose+json";
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Request error: {0}")]
    Request(#[source] reqwest::Error),
    /// 連線失敗或逾時，訊息包含完整的錯誤來源鏈。
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            let chain: Vec<String> = std::iter::successors(
                Some(&e as &(dyn std::error::Error + 'static)),
                |err| err.source(),
            )
            .map(ToString::to_string)
            .collect();
            Self::Unavailable(chain.join(": "))
        } else {
            Self::Request(e)
        }
    }
}

impl HttpError {
    /// 是否為可重試的暫時性錯誤。
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_request() || e.is_body(),
            Self::Unavailable(_) => true,
        }
    }
}

type Result<T> = std::result::Result<T, HttpError>;

/// 與傳輸層無關的回應，標頭名稱一律小寫。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn replay_nonce(&self) -> Option<&str> {
        self.header("replay-nonce").filter(|n| !n.is_empty())
    }

    /// 解析 `Retry-After`，接受秒數或 HTTP 日期。
    pub fn retry_after(&self) -> Option<Duration> {
        let value = self.header("retry-after")?.trim();
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
        Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 錯誤回應中的問題文件；非錯誤或無法解析時為 `None`。
    pub fn problem(&self) -> Option<Problem> {
        let is_problem = self
            .header("content-type")
            .is_some_and(|ct| ct.starts_with(PROBLEM_CONTENT_TYPE));
        if !is_problem && self.is_success() {
            return None;
        }
        serde_json::from_slice::<Problem>(&self.body)
            .ok()
            .filter(|p| !p.problem_type.is_empty())
    }
}

/// 發送 ACME 請求的介面，測試時以模擬伺服器替換。
pub trait HttpClient: Send + Sync + fmt::Debug {
    fn get(&self, url: &str) -> Result<HttpResponse>;
    fn head(&self, url: &str) -> Result<HttpResponse>;
    /// 以 `application/jose+json` 送出已簽名的 JWS。
    fn post_jose(&self, url: &str, body: String) -> Result<HttpResponse>;
}

/// 以阻塞式 reqwest 實作的 [`HttpClient`]。
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    /// # 參數
    ///
    /// - `tls`: 是否驗證伺服器證書；關閉時每次建立都會記錄警告。
    /// - `timeout`: 單一請求的逾時。
    pub fn new(tls: TlsVerification, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));
        if tls == TlsVerification::InsecureSkipVerify {
            warn!("TLS certificate verification is DISABLED for the ACME client");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn from_config(config: &AcmeConfig) -> Result<Self> {
        Self::new(config.tls_verification, config.request_timeout)
    }

    fn convert(response: Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes()?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        Self::convert(self.client.get(url).send()?)
    }

    fn head(&self, url: &str) -> Result<HttpResponse> {
        Self::convert(self.client.head(url).send()?)
    }

    fn post_jose(&self, url: &str, body: String) -> Result<HttpResponse> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, JOSE_CONTENT_TYPE)
            .body(body)
            .send()?;
        Self::convert(response)
    }
}
