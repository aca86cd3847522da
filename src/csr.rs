use std::result;

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::key_pair::KeyPair;

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
}

type Result<T> = result::Result<T, CsrError>;

/// CSR 建構器，每個網域成為一筆 DNS 主體替代名稱 (SAN)，第一個網域同時作為 CN。
///
/// # 範例
///
/// ```
/// use acme_core::{csr::Csr, key_pair::{KeyAlgorithm, KeyPair}};
///
/// let key_pair = KeyPair::generate(KeyAlgorithm::EcP256).expect("金鑰生成失敗");
/// let csr = Csr::new()
///     .set_san("example.com")
///     .set_san("www.example.com")
///     .build(&key_pair)
///     .expect("CSR 建立失敗");
/// ```
#[derive(Debug, Default, Clone)]
pub struct Csr {
    san_entries: Vec<String>,
}

impl Csr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domains<S: AsRef<str>>(domains: &[S]) -> Self {
        domains
            .iter()
            .fold(Self::new(), |csr, d| csr.set_san(d.as_ref()))
    }

    /// 新增一個 DNS SAN，重複的名稱會被忽略。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        let dns_name = dns_name.trim().to_ascii_lowercase();
        if !self.san_entries.contains(&dns_name) {
            self.san_entries.push(dns_name);
        }
        self
    }

    pub fn domains(&self) -> &[String] {
        &self.san_entries
    }

    /// 以 `key_pair` 簽署 CSR。
    ///
    /// # Errors
    ///
    /// 未設定任何 SAN 時回傳 [`CsrError::NoSanEntries`]。
    pub fn build(&self, key_pair: &KeyPair) -> Result<X509Req> {
        let Some(common_name) = self.san_entries.first() else {
            return Err(CsrError::NoSanEntries);
        };
        let mut req_builder = X509Req::builder()?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", common_name)?;
        req_builder.set_subject_name(&name.build())?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(key_pair.private_key())?;
        req_builder.sign(key_pair.private_key(), MessageDigest::sha256())?;

        Ok(req_builder.build())
    }

    /// finalize 請求使用的 DER 編碼。
    pub fn build_der(&self, key_pair: &KeyPair) -> Result<Vec<u8>> {
        Ok(self.build(key_pair)?.to_der()?)
    }
}
