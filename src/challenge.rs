//! 授權與挑戰的資料模型，以及各挑戰類型需要的 key authorization 衍生值。

use std::{fmt, str::FromStr};

use openssl::sha::sha256;
use serde::{Deserialize, Serialize};

use crate::{base64::Base64, payload::Identifier, problem::Problem};

/// HTTP-01 驗證檔案的路徑前綴。
pub const HTTP01_PATH_PREFIX: &str = "/.well-known/acme-challenge/";
/// TLS-ALPN-01 協商使用的 ALPN 協定名稱。
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    Http01,
    Dns01,
    TlsAlpn01,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(Self::Http01),
            "dns-01" => Ok(Self::Dns01),
            "tls-alpn-01" => Ok(Self::TlsAlpn01),
            other => Err(format!("unsupported challenge type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// 伺服器提供的單一挑戰。
///
/// 類型以原字串保存，伺服器提供本庫不認識的類型時不會導致整份授權解析失敗。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl Challenge {
    pub fn challenge_type(&self) -> Option<ChallengeType> {
        self.kind.parse().ok()
    }

    pub fn key_authorization(&self, thumbprint: &str) -> String {
        key_authorization(&self.token, thumbprint)
    }
}

/// `token.thumbprint`（RFC 8555 §8.1）。
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// DNS-01 TXT 記錄內容：key authorization 的 SHA-256，URL 安全 Base64。
pub fn dns_txt_value(key_authorization: &str) -> String {
    Base64::new(sha256(key_authorization.as_bytes())).base64_url()
}

/// TLS-ALPN-01 acmeIdentifier 擴充欄位中的 SHA-256 摘要。
pub fn tls_alpn_digest(key_authorization: &str) -> [u8; 32] {
    sha256(key_authorization.as_bytes())
}

/// DNS-01 記錄名稱，萬用字元授權使用基底網域。
pub fn dns_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    /// 不會再改變的狀態。
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// 單一網域的授權。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
    /// 授權 URL，不在伺服器回應內。
    #[serde(skip)]
    pub url: String,
}

impl Authorization {
    pub fn domain(&self) -> &str {
        &self.identifier.value
    }

    /// 依偏好順序挑選第一個可用的挑戰。
    ///
    /// 萬用字元授權只能使用 DNS-01。
    pub fn select_challenge(&self, preference: &[ChallengeType]) -> Option<(ChallengeType, &Challenge)> {
        preference
            .iter()
            .filter(|ty| !self.wildcard || **ty == ChallengeType::Dns01)
            .find_map(|ty| {
                self.challenges
                    .iter()
                    .find(|c| c.challenge_type() == Some(*ty) && c.status != ChallengeStatus::Invalid)
                    .map(|c| (*ty, c))
            })
    }

    /// 任一挑戰回報的錯誤。
    pub fn failure(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}
