use std::{fmt, str::FromStr};

use openssl::{
    bn::{BigNum, BigNumContext},
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::Rsa,
    sha::sha256,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    base64::{Base64, DecodeError},
    jwk::{Jwk, JwkError},
};

/// 金鑰相關操作的錯誤。
#[derive(Debug, Error)]
pub enum KeyError {
    /// 亂數來源無法使用，金鑰產生失敗。
    #[error("Entropy source unavailable: {0}")]
    Entropy(ErrorStack),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Invalid key record: {0}")]
    InvalidRecord(String),
    #[error("Base64 error: {0}")]
    Base64(#[from] DecodeError),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
}

type Result<T> = std::result::Result<T, KeyError>;

/// P-256 座標與純量的位元組長度。
const P256_FIELD_LEN: i32 = 32;

/// 帳戶金鑰支援的演算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    /// NIST P-256，對應 JWS `ES256`。
    #[default]
    EcP256,
    /// RSA，對應 JWS `RS256`，附帶金鑰位數。
    Rsa(u32),
}

impl KeyAlgorithm {
    const DEFAULT_RSA_BITS: u32 = 2048;

    /// JWS `alg` 欄位的值。
    pub fn jws_alg(&self) -> &'static str {
        match self {
            Self::EcP256 => "ES256",
            Self::Rsa(_) => "RS256",
        }
    }

    /// 曲線或金鑰族識別字，寫入持久化記錄。
    pub fn curve_name(&self) -> &'static str {
        match self {
            Self::EcP256 => "P-256",
            Self::Rsa(_) => "RSA",
        }
    }
}

impl FromStr for KeyAlgorithm {
    type Err = KeyError;

    /// 大小寫不敏感，接受 JWS 名稱或曲線名稱。
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "ES256" | "ECDSA" | "EC" | "P-256" | "P256" => Ok(Self::EcP256),
            "RS256" | "RSA" => Ok(Self::Rsa(Self::DEFAULT_RSA_BITS)),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// 可序列化的金鑰記錄，由持久化協作者保存。
///
/// EC 金鑰以曲線名稱、公鑰仿射座標與私鑰純量（皆為 URL 安全 Base64）表示；
/// RSA 金鑰則保存 PKCS#8 PEM。
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum KeyRecord {
    #[serde(rename = "EC")]
    Ec {
        crv: String,
        x: String,
        y: String,
        d: String,
    },
    #[serde(rename = "RSA")]
    Rsa { pkcs8: String },
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ec { crv, x, y, .. } => f
                .debug_struct("Ec")
                .field("crv", crv)
                .field("x", x)
                .field("y", y)
                .finish_non_exhaustive(),
            Self::Rsa { .. } => f.debug_struct("Rsa").finish_non_exhaustive(),
        }
    }
}

/// 帳戶或憑證使用的非對稱金鑰對。
///
/// 私鑰只存在於此結構與所屬的帳戶記錄中，`Debug` 輸出不包含任何私鑰資料。
#[derive(Clone)]
pub struct KeyPair {
    alg: KeyAlgorithm,
    pri_key: PKey<Private>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// 以密碼學安全亂數產生新的金鑰對。
    ///
    /// # Errors
    ///
    /// 亂數來源或 OpenSSL 無法產生金鑰時回傳 [`KeyError::Entropy`]。
    pub fn generate(alg: KeyAlgorithm) -> Result<Self> {
        let pri_key = match alg {
            KeyAlgorithm::EcP256 => {
                let group = Self::p256_group()?;
                let ec = EcKey::generate(&group).map_err(KeyError::Entropy)?;
                PKey::from_ec_key(ec)?
            }
            KeyAlgorithm::Rsa(bits) => {
                let rsa = Rsa::generate(bits).map_err(KeyError::Entropy)?;
                PKey::from_rsa(rsa)?
            }
        };
        Ok(Self { alg, pri_key })
    }

    /// 由 PEM 格式的私鑰還原金鑰對，演算法依金鑰型別判定。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem)?;
        Self::from_pkey(pri_key)
    }

    fn from_pkey(pri_key: PKey<Private>) -> Result<Self> {
        let alg = match pri_key.id() {
            Id::EC => {
                let ec = pri_key.ec_key()?;
                if ec.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
                    return Err(KeyError::UnsupportedAlgorithm(
                        "EC curve other than P-256".to_string(),
                    ));
                }
                KeyAlgorithm::EcP256
            }
            Id::RSA => KeyAlgorithm::Rsa(pri_key.rsa()?.size() * 8),
            other => return Err(KeyError::UnsupportedAlgorithm(format!("{:?}", other))),
        };
        Ok(Self { alg, pri_key })
    }

    /// PKCS#8 PEM 格式的私鑰。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 轉換成可持久化的記錄。
    pub fn to_record(&self) -> Result<KeyRecord> {
        match self.alg {
            KeyAlgorithm::EcP256 => {
                let ec = self.pri_key.ec_key()?;
                let (x, y) = Self::ec_coordinates(&ec)?;
                let d = ec.private_key().to_vec_padded(P256_FIELD_LEN)?;
                Ok(KeyRecord::Ec {
                    crv: self.alg.curve_name().to_string(),
                    x: Base64::new(x).base64_url(),
                    y: Base64::new(y).base64_url(),
                    d: Base64::new(d).base64_url(),
                })
            }
            KeyAlgorithm::Rsa(_) => Ok(KeyRecord::Rsa {
                pkcs8: String::from_utf8_lossy(&self.to_pem()?).into_owned(),
            }),
        }
    }

    /// 由持久化記錄還原金鑰對，並驗證私鑰與公鑰座標一致。
    pub fn from_record(record: &KeyRecord) -> Result<Self> {
        match record {
            KeyRecord::Ec { crv, x, y, d } => {
                if crv.parse::<KeyAlgorithm>()? != KeyAlgorithm::EcP256 {
                    return Err(KeyError::UnsupportedAlgorithm(crv.clone()));
                }
                let group = Self::p256_group()?;
                let x = BigNum::from_slice(Base64::from_url(x)?.as_bytes())?;
                let y = BigNum::from_slice(Base64::from_url(y)?.as_bytes())?;
                let d = BigNum::from_slice(Base64::from_url(d)?.as_bytes())?;
                let public = EcKey::from_public_key_affine_coordinates(&group, &x, &y)
                    .map_err(|e| KeyError::InvalidRecord(e.to_string()))?;
                let ec = EcKey::from_private_components(&group, &d, public.public_key())?;
                ec.check_key()
                    .map_err(|e| KeyError::InvalidRecord(e.to_string()))?;
                Ok(Self {
                    alg: KeyAlgorithm::EcP256,
                    pri_key: PKey::from_ec_key(ec)?,
                })
            }
            KeyRecord::Rsa { pkcs8 } => Self::from_pem(pkcs8.as_bytes()),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.alg
    }

    /// JWS `alg` 欄位的值。
    pub fn jws_alg(&self) -> &'static str {
        self.alg.jws_alg()
    }

    /// RFC 7638 JWK thumbprint，URL 安全 Base64。
    ///
    /// 用於組成挑戰的 key authorization。
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = Jwk::new(self)?;
        let hash = sha256(jwk.to_acme_json()?.as_bytes());
        Ok(Base64::new(hash).base64_url())
    }

    /// EC 公鑰的仿射座標，長度固定為 32 位元組。
    pub(crate) fn ec_public_coordinates(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let ec = self.pri_key.ec_key()?;
        Self::ec_coordinates(&ec)
    }

    pub(crate) fn private_key(&self) -> &PKey<Private> {
        &self.pri_key
    }

    /// 比較兩把金鑰的公鑰部分。
    pub fn same_public_key(&self, other: &KeyPair) -> bool {
        self.pri_key.public_eq(&other.pri_key)
    }

    fn ec_coordinates(ec: &EcKey<Private>) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        ec.public_key()
            .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)?;
        Ok((
            x.to_vec_padded(P256_FIELD_LEN)?,
            y.to_vec_padded(P256_FIELD_LEN)?,
        ))
    }

    fn p256_group() -> Result<EcGroup> {
        Ok(EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?)
    }
}
