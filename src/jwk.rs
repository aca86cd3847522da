use openssl::error::ErrorStack;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    base64::Base64,
    key_pair::{KeyAlgorithm, KeyError, KeyPair},
};

/// JWK 產生與序列化時的錯誤。
#[derive(Debug, Error)]
pub enum JwkError {
    #[error("Failed to convert key: {0}")]
    KeyConversion(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ErrorStack> for JwkError {
    fn from(e: ErrorStack) -> Self {
        JwkError::KeyConversion(e.to_string())
    }
}

impl From<KeyError> for JwkError {
    fn from(e: KeyError) -> Self {
        JwkError::KeyConversion(e.to_string())
    }
}

/// JSON Web Key，只包含公鑰參數。
///
/// 欄位順序固定，`to_acme_json` 產生 RFC 7638 thumbprint 所需的正規形式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "EC")]
    Ec(EcJwk),
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub crv: String,
    pub x: String,
    pub y: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub n: String,
    pub e: String,
}

impl Jwk {
    /// 由金鑰對的公鑰部分建立 JWK。
    pub fn new(key_pair: &KeyPair) -> Result<Self, JwkError> {
        match key_pair.algorithm() {
            KeyAlgorithm::EcP256 => {
                let (x, y) = key_pair.ec_public_coordinates()?;
                Ok(Jwk::Ec(EcJwk {
                    crv: "P-256".to_string(),
                    x: Base64::new(x).base64_url(),
                    y: Base64::new(y).base64_url(),
                }))
            }
            KeyAlgorithm::Rsa(_) => {
                let rsa = key_pair.private_key().rsa()?;
                Ok(Jwk::Rsa(RsaJwk {
                    n: Base64::new(rsa.n().to_vec()).base64_url(),
                    e: Base64::new(rsa.e().to_vec()).base64_url(),
                }))
            }
        }
    }

    /// 只含必要成員、依字典序排列的 JSON（RFC 7638 §3.2）。
    pub fn to_acme_json(&self) -> Result<String, JwkError> {
        let mut map = Map::new();
        match self {
            Jwk::Ec(jwk) => {
                map.insert("crv".to_string(), Value::String(jwk.crv.clone()));
                map.insert("kty".to_string(), Value::String("EC".to_string()));
                map.insert("x".to_string(), Value::String(jwk.x.clone()));
                map.insert("y".to_string(), Value::String(jwk.y.clone()));
            }
            Jwk::Rsa(jwk) => {
                map.insert("e".to_string(), Value::String(jwk.e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(jwk.n.clone()));
            }
        }
        serde_json::to_string(&Value::Object(map)).map_err(JwkError::from)
    }

    pub fn to_value(&self) -> Result<Value, JwkError> {
        serde_json::to_value(self).map_err(JwkError::from)
    }
}
