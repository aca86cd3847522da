use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{
    base64::Base64,
    jwk::{Jwk, JwkError},
    nonce::{NonceError, NonceT},
};

/// 定義保護機制中可能產生的錯誤類型。
#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// 未指定 jwk/kid，或 kid 為空。
    #[error("Missing signing key: {0}")]
    MissingKey(String),
}

type Result<T> = std::result::Result<T, ProtectionError>;

/// 保護頭中識別簽名金鑰的方式。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMode {
    /// 內嵌公鑰，僅用於 newAccount、revokeCert（以憑證金鑰簽名時）與 keyChange 內層。
    Jwk(Jwk),
    /// 帳戶 URL。
    Kid(String),
}

/// 表示數字簽章保護頭部的資料結構。
#[derive(Debug, Clone, Serialize)]
pub struct ProtectedHeader {
    alg: String,
    /// keyChange 內層 JWS 不帶 nonce。
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    /// 不含 nonce 的 jwk 模式保護頭，供 keyChange 內層 JWS 使用。
    pub fn without_nonce(alg: &str, url: impl Into<String>, jwk: &Jwk) -> Result<Self> {
        Ok(Self {
            alg: normalize_alg(alg)?.to_string(),
            nonce: None,
            url: url.into(),
            jwk: Some(jwk.to_value()?),
            kid: None,
        })
    }

    pub fn to_base64(&self) -> Result<Base64> {
        Ok(Base64::new(serde_json::to_vec(self)?))
    }

    pub fn alg(&self) -> &str {
        &self.alg
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn normalize_alg(alg: &str) -> Result<&'static str> {
    match alg.to_uppercase().as_str() {
        "ES256" => Ok("ES256"),
        "RS256" => Ok("RS256"),
        other => Err(ProtectionError::UnsupportedAlgorithm(other.to_string())),
    }
}

/// 用於生成保護頭（Protected Header）的結構體。
pub struct Protection<'a> {
    nonce: &'a dyn NonceT,
    alg: &'static str,
    mode: Option<KeyMode>,
}

impl<'a> Protection<'a> {
    /// 建立新的 [`Protection`]，僅接受 `ES256` 與 `RS256`（不區分大小寫）。
    pub fn new(nonce: &'a dyn NonceT, alg: &str) -> Result<Self> {
        Ok(Self {
            nonce,
            alg: normalize_alg(alg)?,
            mode: None,
        })
    }

    pub fn with_mode(mut self, mode: KeyMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// 生成保護頭。
    ///
    /// Nonce 取得後立即標記為已使用，之後即使請求失敗也不會再被使用。
    ///
    /// # Errors
    ///
    /// 未設定金鑰模式、kid 為空或無法取得 nonce 時回傳錯誤；此時不會消耗任何 nonce。
    pub fn create_header(&self, url: impl Into<String>) -> Result<ProtectedHeader> {
        let (jwk, kid) = match &self.mode {
            Some(KeyMode::Jwk(jwk)) => (Some(jwk.to_value()?), None),
            Some(KeyMode::Kid(kid)) if !kid.trim().is_empty() => (None, Some(kid.clone())),
            Some(KeyMode::Kid(_)) => {
                return Err(ProtectionError::MissingKey("empty account URL".into()))
            }
            None => return Err(ProtectionError::MissingKey("no jwk or kid".into())),
        };

        let nonce = self.nonce.acquire()?;
        self.nonce.consume(&nonce);

        Ok(ProtectedHeader {
            alg: self.alg.to_string(),
            nonce: Some(nonce),
            url: url.into(),
            jwk,
            kid,
        })
    }
}
