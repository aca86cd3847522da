//! RFC 7807 問題文件與 ACME 錯誤型別（RFC 8555 §6.7）。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::payload::Identifier;

const ACME_ERROR_PREFIX: &str = "urn:ietf:params:acme:error:";

/// 伺服器回傳的問題文件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Subproblem>,
}

/// 複合錯誤中針對單一識別項的子問題。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
}

/// ACME 定義的錯誤種類。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    AccountDoesNotExist,
    AlreadyRevoked,
    BadCsr,
    BadNonce,
    BadPublicKey,
    BadRevocationReason,
    BadSignatureAlgorithm,
    Caa,
    Compound,
    Connection,
    Dns,
    ExternalAccountRequired,
    IncorrectResponse,
    InvalidContact,
    Malformed,
    OrderNotReady,
    RateLimited,
    RejectedIdentifier,
    ServerInternal,
    Tls,
    Unauthorized,
    UnsupportedContact,
    UnsupportedIdentifier,
    UserActionRequired,
    /// 非 ACME 命名空間或未知的型別，保留原字串。
    Other(String),
}

impl ProblemKind {
    fn from_type(problem_type: &str) -> Self {
        let Some(name) = problem_type.strip_prefix(ACME_ERROR_PREFIX) else {
            return Self::Other(problem_type.to_string());
        };
        match name {
            "accountDoesNotExist" => Self::AccountDoesNotExist,
            "alreadyRevoked" => Self::AlreadyRevoked,
            "badCSR" => Self::BadCsr,
            "badNonce" => Self::BadNonce,
            "badPublicKey" => Self::BadPublicKey,
            "badRevocationReason" => Self::BadRevocationReason,
            "badSignatureAlgorithm" => Self::BadSignatureAlgorithm,
            "caa" => Self::Caa,
            "compound" => Self::Compound,
            "connection" => Self::Connection,
            "dns" => Self::Dns,
            "externalAccountRequired" => Self::ExternalAccountRequired,
            "incorrectResponse" => Self::IncorrectResponse,
            "invalidContact" => Self::InvalidContact,
            "malformed" => Self::Malformed,
            "orderNotReady" => Self::OrderNotReady,
            "rateLimited" => Self::RateLimited,
            "rejectedIdentifier" => Self::RejectedIdentifier,
            "serverInternal" => Self::ServerInternal,
            "tls" => Self::Tls,
            "unauthorized" => Self::Unauthorized,
            "unsupportedContact" => Self::UnsupportedContact,
            "unsupportedIdentifier" => Self::UnsupportedIdentifier,
            "userActionRequired" => Self::UserActionRequired,
            _ => Self::Other(problem_type.to_string()),
        }
    }
}

impl Problem {
    /// 以 ACME 錯誤名稱（不含 URN 前綴）建立問題文件。
    pub fn acme(name: &str, detail: impl Into<String>, status: u16) -> Self {
        Self {
            problem_type: format!("{}{}", ACME_ERROR_PREFIX, name),
            detail: Some(detail.into()),
            status: Some(status),
            instance: None,
            subproblems: Vec::new(),
        }
    }

    pub fn kind(&self) -> ProblemKind {
        ProblemKind::from_type(&self.problem_type)
    }

    pub fn is(&self, kind: ProblemKind) -> bool {
        self.kind() == kind
    }
}

/// 錯誤訊息中附加的問題描述，沒有問題文件時為空字串。
pub(crate) fn describe(problem: &Option<Problem>) -> String {
    problem
        .as_ref()
        .map(|p| format!(" ({})", p))
        .unwrap_or_default()
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.problem_type)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        for sub in &self.subproblems {
            let target = sub
                .identifier
                .as_ref()
                .map(|id| id.value.as_str())
                .unwrap_or("?");
            write!(
                f,
                "; [{}] {}: {}",
                target,
                sub.problem_type,
                sub.detail.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}
