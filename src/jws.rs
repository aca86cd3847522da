//! JSON Web Signature (JWS) 的扁平 JSON 序列化與簽名。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    base64::Base64,
    key_pair::KeyPair,
    nonce::NonceT,
    payload::{PayloadError, PayloadT},
    protection::{KeyMode, ProtectedHeader, Protection, ProtectionError},
    signature::{create_signature, SignatureError},
};

/// 表示與 JWS 相關的錯誤。
#[derive(Error, Debug)]
pub enum JwsError {
    /// 金鑰缺失、演算法不支援或簽名運算失敗。
    #[error("Signing error: {0}")]
    Signing(String),
    #[error("Protection error: {0}")]
    Protection(#[from] ProtectionError),
    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<SignatureError> for JwsError {
    fn from(e: SignatureError) -> Self {
        JwsError::Signing(e.to_string())
    }
}

type Result<T> = std::result::Result<T, JwsError>;

/// 扁平 JSON 序列化的 JWS（RFC 7515 §7.2.2）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jws {
    protected: String,
    payload: String,
    signature: String,
}

impl Jws {
    pub fn new(header_b64: &Base64, payload_b64: &Base64, signature_b64: &Base64) -> Self {
        Jws {
            protected: header_b64.base64_url(),
            payload: payload_b64.base64_url(),
            signature: signature_b64.base64_url(),
        }
    }

    /// 以 `key_pair` 對保護頭與載荷簽名。
    ///
    /// `payload` 為 `None` 時產生 POST-as-GET 請求，載荷欄位為空字串。
    pub fn sign<P: PayloadT>(
        header: &ProtectedHeader,
        payload: Option<&P>,
        key_pair: &KeyPair,
    ) -> Result<Self> {
        if header.alg() != key_pair.jws_alg() {
            return Err(JwsError::Signing(format!(
                "header alg {} does not match key algorithm {}",
                header.alg(),
                key_pair.jws_alg()
            )));
        }
        let payload_b64 = match payload {
            Some(payload) => {
                payload.validate()?;
                payload.to_base64()?
            }
            None => Base64::new(""),
        };
        let header_b64 = header.to_base64()?;
        let signature = create_signature(&header_b64, &payload_b64, key_pair)?;
        Ok(Self::new(&header_b64, &payload_b64, &signature))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn protected(&self) -> &str {
        &self.protected
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// keyChange 的外層載荷就是內層 JWS 本身。
impl PayloadT for Jws {
    fn validate(&self) -> std::result::Result<(), PayloadError> {
        if self.protected.is_empty() || self.signature.is_empty() {
            return Err(PayloadError("nested JWS is incomplete".into()));
        }
        Ok(())
    }
}

/// 結合 nonce 來源與帳戶金鑰的簽名器。
pub struct JwsSigner<'a> {
    nonce: &'a dyn NonceT,
    key_pair: &'a KeyPair,
}

impl<'a> JwsSigner<'a> {
    pub fn new(nonce: &'a dyn NonceT, key_pair: &'a KeyPair) -> Self {
        Self { nonce, key_pair }
    }

    /// 建立保護頭（消耗一個 nonce）並簽名。
    pub fn sign<P: PayloadT>(&self, mode: &KeyMode, url: &str, payload: Option<&P>) -> Result<Jws> {
        let header = Protection::new(self.nonce, self.key_pair.jws_alg())?
            .with_mode(mode.clone())
            .create_header(url)?;
        Jws::sign(&header, payload, self.key_pair)
    }
}

#[cfg(test)]
mod tests {
    use openssl::pkey::PKey;

    use super::*;
    use crate::{
        jwk::Jwk,
        key_pair::KeyAlgorithm,
        nonce::FixedNonce,
        payload::{ChallengeValidationPayload, NewAccountPayload},
        testing::verify_es256,
    };

    fn decode(part: &str) -> serde_json::Value {
        serde_json::from_slice(Base64::from_url(part).unwrap().as_bytes()).unwrap()
    }

    #[test]
    fn test_sign_with_jwk_verifies() -> Result<()> {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let nonce = FixedNonce::new("nonce-1");
        let mode = KeyMode::Jwk(Jwk::new(&key).unwrap());
        let jws = JwsSigner::new(&nonce, &key).sign(
            &mode,
            "https://ca.example/new-acct",
            Some(&NewAccountPayload::new("a@example.com", true)),
        )?;

        let header = decode(jws.protected());
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["nonce"], "nonce-1");
        assert_eq!(header["url"], "https://ca.example/new-acct");
        assert_eq!(decode(jws.payload())["termsOfServiceAgreed"], true);

        let input = format!("{}.{}", jws.protected(), jws.payload());
        let signature = Base64::from_url(jws.signature()).unwrap();
        let pem = key.private_key().public_key_to_pem().unwrap();
        let public = PKey::public_key_from_pem(&pem).unwrap().ec_key().unwrap();
        assert!(verify_es256(input.as_bytes(), signature.as_bytes(), &public));
        Ok(())
    }

    #[test]
    fn test_post_as_get_has_empty_payload() -> Result<()> {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let nonce = FixedNonce::new("nonce-2");
        let jws = JwsSigner::new(&nonce, &key).sign::<ChallengeValidationPayload>(
            &KeyMode::Kid("https://ca.example/acct/1".into()),
            "https://ca.example/order/1",
            None,
        )?;
        assert_eq!(jws.payload(), "");
        assert!(jws.to_json()?.contains(r#""payload":"""#));
        Ok(())
    }

    #[test]
    fn test_invalid_payload_is_not_signed() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let nonce = FixedNonce::new("nonce-3");
        let result = JwsSigner::new(&nonce, &key).sign(
            &KeyMode::Jwk(Jwk::new(&key).unwrap()),
            "https://ca.example/new-acct",
            Some(&NewAccountPayload::new("broken", true)),
        );
        assert!(matches!(result, Err(JwsError::Payload(_))));
    }

    #[test]
    fn test_mismatched_algorithm() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256).unwrap();
        let nonce = FixedNonce::new("nonce-4");
        let header = Protection::new(&nonce, "RS256")
            .unwrap()
            .with_mode(KeyMode::Kid("https://ca.example/acct/1".into()))
            .create_header("https://ca.example/x")
            .unwrap();
        assert!(matches!(
            Jws::sign::<ChallengeValidationPayload>(&header, None, &key),
            Err(JwsError::Signing(_))
        ));
    }
}
