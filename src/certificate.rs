use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    x509::X509,
};
use thiserror::Error;

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    Parse(#[from] openssl::error::ErrorStack),
    #[error("Certificate chain is empty")]
    Empty,
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

type Result<T> = std::result::Result<T, CertificateError>;

/// X.509 證書封裝結構，提供基本的證書解析與續約檢查功能
#[derive(Clone)]
pub struct Certificate {
    cert: X509,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("dns_names", &self.dns_names())
            .finish()
    }
}

impl Certificate {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Ok(Self {
            cert: X509::from_pem(pem)?,
        })
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        Ok(Self {
            cert: X509::from_der(der)?,
        })
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_pem()?)
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.cert.to_der()?)
    }

    pub fn x509(&self) -> &X509 {
        &self.cert
    }

    /// 證書的到期時間。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(self.cert.not_after())?;
        let secs = i64::from(diff.days) * 86400 + i64::from(diff.secs);
        DateTime::from_timestamp(secs, 0).ok_or(CertificateError::InvalidTimestamp)
    }

    /// 判斷證書是否應該進行續約
    ///
    /// 剩餘有效時間小於或等於 `threshold_days` 天（或已過期）時回傳 `true`。
    pub fn should_renew(&self, threshold_days: u32) -> Result<bool> {
        let now = Asn1Time::from_unix(Utc::now().timestamp())?;
        let remaining = remaining_seconds(&now, self.cert.not_after())?;
        Ok(remaining <= i64::from(threshold_days) * 86400)
    }

    /// 主體替代名稱中的 DNS 名稱。
    pub fn dns_names(&self) -> Vec<String> {
        self.cert
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.dnsname().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn remaining_seconds(now: &Asn1TimeRef, not_after: &Asn1TimeRef) -> Result<i64> {
    let diff = now.diff(not_after)?;
    Ok(i64::from(diff.days) * 86400 + i64::from(diff.secs))
}

/// 終端證書在前的 PEM 證書鏈。
#[derive(Debug, Clone)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let certificates: Vec<Certificate> = X509::stack_from_pem(pem)?
            .into_iter()
            .map(|cert| Certificate { cert })
            .collect();
        if certificates.is_empty() {
            return Err(CertificateError::Empty);
        }
        Ok(Self { certificates })
    }

    /// 終端證書。
    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        let mut pem = Vec::new();
        for cert in &self.certificates {
            pem.extend(cert.to_pem()?);
        }
        Ok(pem)
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}
