use ::base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use thiserror::Error;

/// Base64 解碼失敗時的錯誤。
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Base64 decode error: {0}")]
pub struct DecodeError(String);

impl From<::base64::DecodeError> for DecodeError {
    fn from(e: ::base64::DecodeError) -> Self {
        DecodeError(e.to_string())
    }
}

/// 持有原始位元組的 Base64 包裝型別。
///
/// ACME 協議中的 JWS、JWK 與 thumbprint 一律使用不帶填充的 URL 安全編碼，
/// 因此 [`Base64::base64_url`] 是最常用的輸出形式。
///
/// ```
/// # use acme_core::base64::Base64;
/// let b64 = Base64::new("Hello, World!");
/// assert_eq!(b64.as_standard(), "SGVsbG8sIFdvcmxkIQ==");
/// assert_eq!(b64.base64_url(), "SGVsbG8sIFdvcmxkIQ");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Base64 {
    bytes: Vec<u8>,
}

impl Base64 {
    /// 由任意位元組資料建立。
    pub fn new<T: AsRef<[u8]>>(input: T) -> Self {
        Self {
            bytes: input.as_ref().to_vec(),
        }
    }

    /// 解析 URL 安全（可不帶填充）的 Base64 字串。
    pub fn from_url(url_encoded: &str) -> Result<Self, DecodeError> {
        let trimmed = url_encoded.trim_end_matches('=');
        Ok(Self {
            bytes: URL_SAFE_NO_PAD.decode(trimmed)?,
        })
    }

    /// 解析標準 Base64 字串。
    pub fn from_encoded(encoded: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            bytes: STANDARD.decode(encoded)?,
        })
    }

    /// 不帶填充的 URL 安全編碼。
    pub fn base64_url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.bytes)
    }

    /// 標準（帶填充）編碼。
    pub fn as_standard(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// 原始位元組。
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
