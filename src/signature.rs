use openssl::{ecdsa::EcdsaSig, hash::MessageDigest, sha::sha256, sign::Signer};
use thiserror::Error;

use crate::{base64::Base64, key_pair::KeyPair};

/// 簽名操作可能遇到的錯誤。
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Signing error: {0}")]
    Signing(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl From<openssl::error::ErrorStack> for SignatureError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        SignatureError::Signing(e.to_string())
    }
}

type Result<T> = std::result::Result<T, SignatureError>;

/// ES256 簽章中 r 與 s 各自的長度。
const ES256_COMPONENT_LEN: i32 = 32;

/// 簽名演算法的介面。
trait SignatureAlgorithmT {
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>>;
}

/// RS256：RSASSA-PKCS1-v1_5 + SHA-256。
struct Rs256Signature;

impl SignatureAlgorithmT for Rs256Signature {
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), key_pair.private_key())?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }
}

/// ES256：ECDSA P-256 + SHA-256，輸出 JWS 要求的固定長度 `r || s`，而非 DER。
struct Es256Signature;

impl SignatureAlgorithmT for Es256Signature {
    fn sign(&self, data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>> {
        let ec = key_pair.private_key().ec_key()?;
        let digest = sha256(data);
        let sig = EcdsaSig::sign(&digest, &ec)?;
        let mut out = sig.r().to_vec_padded(ES256_COMPONENT_LEN)?;
        out.extend(sig.s().to_vec_padded(ES256_COMPONENT_LEN)?);
        Ok(out)
    }
}

/// 根據 JWS 演算法名稱取得簽名實作。
struct SignatureAlgorithmFactory;

impl SignatureAlgorithmFactory {
    fn get_algorithm(alg: &str) -> Result<Box<dyn SignatureAlgorithmT>> {
        match alg {
            "ES256" => Ok(Box::new(Es256Signature)),
            "RS256" => Ok(Box::new(Rs256Signature)),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// 以金鑰對對任意資料簽名。
pub fn sign_bytes(data: &[u8], key_pair: &KeyPair) -> Result<Vec<u8>> {
    let algorithm = SignatureAlgorithmFactory::get_algorithm(key_pair.jws_alg())?;
    algorithm.sign(data, key_pair)
}

/// 以 `BASE64URL(header).BASE64URL(payload)` 作為簽名輸入，產生 JWS 簽名。
pub fn create_signature(
    header_b64: &Base64,
    payload_b64: &Base64,
    key_pair: &KeyPair,
) -> Result<Base64> {
    let signing_input = signing_input(header_b64, payload_b64);
    Ok(Base64::new(sign_bytes(signing_input.as_bytes(), key_pair)?))
}

/// payload 為空時（POST-as-GET）簽名輸入的第二段為空字串。
pub(crate) fn signing_input(header_b64: &Base64, payload_b64: &Base64) -> String {
    format!("{}.{}", header_b64.base64_url(), payload_b64.base64_url())
}
