//! 挑戰解決器：把挑戰轉成可發佈的驗證記錄，並透過 [`Provisioner`] 發佈與移除。

use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};

use openssl::{
    asn1::{Asn1Object, Asn1OctetString, Asn1Time},
    bn::{BigNum, MsbOption},
    error::ErrorStack,
    hash::MessageDigest,
    x509::{
        extension::SubjectAlternativeName, X509Extension, X509NameBuilder, X509,
    },
};
use thiserror::Error;
use tracing::debug;

use crate::{
    challenge::{
        dns_record_name, dns_txt_value, tls_alpn_digest, Challenge, ChallengeType,
        HTTP01_PATH_PREFIX,
    },
    cloudflare::CloudflareProvisioner,
    config::AcmeConfig,
    key_pair::{KeyAlgorithm, KeyError, KeyPair},
};

/// id-pe-acmeIdentifier（RFC 8737）。
pub const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";
/// TLS-ALPN-01 驗證證書的有效天數。
const TLS_ALPN_CERT_DAYS: u32 = 7;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Provider API error: {0}")]
    Api(String),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Invalid challenge token: {0}")]
    InvalidToken(String),
    #[error("{provisioner} cannot publish {record} records")]
    Unsupported {
        provisioner: &'static str,
        record: &'static str,
    },
    #[error("Lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// 要對外發佈的驗證資料。
#[derive(Clone)]
pub enum ProofRecord {
    /// 於 `/.well-known/acme-challenge/{token}` 回應 key authorization。
    HttpToken {
        domain: String,
        token: String,
        key_authorization: String,
    },
    /// `_acme-challenge` TXT 記錄。
    DnsTxt {
        domain: String,
        name: String,
        value: String,
    },
    /// 以 `acme-tls/1` 協商時出示的自簽證書。
    TlsAlpnCertificate {
        domain: String,
        certificate: X509,
        key: KeyPair,
    },
}

impl ProofRecord {
    pub fn domain(&self) -> &str {
        match self {
            Self::HttpToken { domain, .. }
            | Self::DnsTxt { domain, .. }
            | Self::TlsAlpnCertificate { domain, .. } => domain,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::HttpToken { .. } => "http-01",
            Self::DnsTxt { .. } => "dns-01",
            Self::TlsAlpnCertificate { .. } => "tls-alpn-01",
        }
    }

    fn key(&self) -> String {
        match self {
            Self::HttpToken { token, .. } => format!("http:{}", token),
            Self::DnsTxt { name, value, .. } => format!("dns:{}:{}", name, value),
            Self::TlsAlpnCertificate { domain, .. } => format!("tls:{}", domain),
        }
    }
}

impl fmt::Debug for ProofRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpToken { domain, token, .. } => f
                .debug_struct("HttpToken")
                .field("domain", domain)
                .field("token", token)
                .finish_non_exhaustive(),
            Self::DnsTxt { domain, name, value } => f
                .debug_struct("DnsTxt")
                .field("domain", domain)
                .field("name", name)
                .field("value", value)
                .finish(),
            Self::TlsAlpnCertificate { domain, .. } => f
                .debug_struct("TlsAlpnCertificate")
                .field("domain", domain)
                .finish_non_exhaustive(),
        }
    }
}

/// 發佈／移除驗證記錄的外部邊界。
///
/// `remove` 必須是冪等的：移除不存在的記錄視為成功。
pub trait Provisioner: Send + Sync + fmt::Debug {
    fn publish(&self, record: &ProofRecord) -> Result<()>;
    fn remove(&self, record: &ProofRecord) -> Result<()>;
}

/// 依挑戰類型分派的解決器。
#[derive(Debug, Clone)]
pub enum ChallengeSolver {
    Http01(Arc<dyn Provisioner>),
    Dns01(Arc<dyn Provisioner>),
    TlsAlpn01(Arc<dyn Provisioner>),
}

impl ChallengeSolver {
    pub fn challenge_type(&self) -> ChallengeType {
        match self {
            Self::Http01(_) => ChallengeType::Http01,
            Self::Dns01(_) => ChallengeType::Dns01,
            Self::TlsAlpn01(_) => ChallengeType::TlsAlpn01,
        }
    }

    fn provisioner(&self) -> &dyn Provisioner {
        match self {
            Self::Http01(p) | Self::Dns01(p) | Self::TlsAlpn01(p) => p.as_ref(),
        }
    }

    /// 由挑戰與帳戶金鑰 thumbprint 推導要發佈的記錄。
    ///
    /// # 參數
    ///
    /// - `domain`: 授權的識別碼，萬用字元網域需先去掉 `*.`。
    /// - `challenge`: 與解決器類型相符的挑戰。
    /// - `thumbprint`: 帳戶金鑰的 RFC 7638 thumbprint。
    ///
    /// # 錯誤
    ///
    /// TLS-ALPN-01 產生自簽證書失敗時回傳 [`ProvisionError::OpenSSL`]。
    pub fn proof(&self, domain: &str, challenge: &Challenge, thumbprint: &str) -> Result<ProofRecord> {
        let key_authorization = challenge.key_authorization(thumbprint);
        Ok(match self {
            Self::Http01(_) => ProofRecord::HttpToken {
                domain: domain.to_string(),
                token: challenge.token.clone(),
                key_authorization,
            },
            Self::Dns01(_) => ProofRecord::DnsTxt {
                domain: domain.to_string(),
                name: dns_record_name(domain),
                value: dns_txt_value(&key_authorization),
            },
            Self::TlsAlpn01(_) => {
                let (certificate, key) = tls_alpn_certificate(domain, &key_authorization)?;
                ProofRecord::TlsAlpnCertificate {
                    domain: domain.to_string(),
                    certificate,
                    key,
                }
            }
        })
    }

    /// 發佈記錄；回傳後記錄必須已可被外部觀察到。
    pub fn prepare(&self, record: &ProofRecord) -> Result<()> {
        debug!(domain = record.domain(), kind = record.kind(), "Publishing challenge proof");
        self.provisioner().publish(record)
    }

    /// 移除 [`Self::prepare`] 發佈的記錄，記錄不存在時也視為成功。
    pub fn cleanup(&self, record: &ProofRecord) -> Result<()> {
        debug!(domain = record.domain(), kind = record.kind(), "Removing challenge proof");
        self.provisioner().remove(record)
    }
}

/// 產生 TLS-ALPN-01 自簽證書（RFC 8737 §3）。
///
/// 證書只含一個 DNS SAN，並帶有關鍵的 acmeIdentifier 擴充欄位，
/// 其內容為 key authorization SHA-256 摘要的 DER OCTET STRING。
pub fn tls_alpn_certificate(domain: &str, key_authorization: &str) -> Result<(X509, KeyPair)> {
    let key = KeyPair::generate(KeyAlgorithm::EcP256)?;
    let digest = tls_alpn_digest(key_authorization);
    let mut der = vec![0x04, digest.len() as u8];
    der.extend_from_slice(&digest);

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", domain)?;
    let name = name.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(key.private_key())?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(TLS_ALPN_CERT_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    let san = SubjectAlternativeName::new()
        .dns(domain)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;
    let oid = Asn1Object::from_str(ACME_IDENTIFIER_OID)?;
    let value = Asn1OctetString::new_from_bytes(&der)?;
    builder.append_extension(X509Extension::new_from_der(&oid, true, &value)?)?;

    builder.sign(key.private_key(), MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<String, ProofRecord>,
    published: HashMap<String, usize>,
    removed: HashMap<String, usize>,
}

/// 記憶體內的發佈目標，供內嵌的 HTTP 或 TLS 回應端查詢。
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    state: Mutex<MemoryState>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| ProvisionError::LockPoisoned)
    }

    /// HTTP-01：依 token 取得應回應的 key authorization。
    pub fn http_response(&self, token: &str) -> Option<String> {
        let state = self.lock().ok()?;
        match state.records.get(&format!("http:{}", token)) {
            Some(ProofRecord::HttpToken {
                key_authorization, ..
            }) => Some(key_authorization.clone()),
            _ => None,
        }
    }

    /// DNS-01：某名稱下目前所有 TXT 值。
    pub fn txt_values(&self, name: &str) -> Vec<String> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        state
            .records
            .values()
            .filter_map(|r| match r {
                ProofRecord::DnsTxt { name: n, value, .. } if n == name => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    /// TLS-ALPN-01：某網域應出示的證書與私鑰。
    pub fn tls_certificate(&self, domain: &str) -> Option<(X509, KeyPair)> {
        let state = self.lock().ok()?;
        match state.records.get(&format!("tls:{}", domain)) {
            Some(ProofRecord::TlsAlpnCertificate {
                certificate, key, ..
            }) => Some((certificate.clone(), key.clone())),
            _ => None,
        }
    }

    pub fn is_published(&self, domain: &str) -> bool {
        self.lock()
            .map(|s| s.records.values().any(|r| r.domain() == domain))
            .unwrap_or(false)
    }

    pub fn publish_count(&self, domain: &str) -> usize {
        self.lock()
            .map(|s| s.published.get(domain).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn remove_count(&self, domain: &str) -> usize {
        self.lock()
            .map(|s| s.removed.get(domain).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Provisioner for MemoryProvisioner {
    fn publish(&self, record: &ProofRecord) -> Result<()> {
        let mut state = self.lock()?;
        *state.published.entry(record.domain().to_string()).or_default() += 1;
        state.records.insert(record.key(), record.clone());
        Ok(())
    }

    fn remove(&self, record: &ProofRecord) -> Result<()> {
        let mut state = self.lock()?;
        *state.removed.entry(record.domain().to_string()).or_default() += 1;
        state.records.remove(&record.key());
        Ok(())
    }
}

/// HTTP-01：把 key authorization 寫入既有網站根目錄下的
/// `.well-known/acme-challenge/{token}`。
#[derive(Debug, Clone)]
pub struct WebrootProvisioner {
    root: PathBuf,
}

impl WebrootProvisioner {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, token: &str) -> Result<PathBuf> {
        let valid = !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(ProvisionError::InvalidToken(token.to_string()));
        }
        Ok(self
            .root
            .join(HTTP01_PATH_PREFIX.trim_start_matches('/'))
            .join(token))
    }

    fn unsupported(record: &ProofRecord) -> ProvisionError {
        ProvisionError::Unsupported {
            provisioner: "webroot",
            record: record.kind(),
        }
    }
}

impl Provisioner for WebrootProvisioner {
    fn publish(&self, record: &ProofRecord) -> Result<()> {
        let ProofRecord::HttpToken {
            token,
            key_authorization,
            ..
        } = record
        else {
            return Err(Self::unsupported(record));
        };
        let path = self.path_for(token)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, key_authorization)?;
        Ok(())
    }

    fn remove(&self, record: &ProofRecord) -> Result<()> {
        let ProofRecord::HttpToken { token, .. } = record else {
            return Err(Self::unsupported(record));
        };
        match fs::remove_file(self.path_for(token)?) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// 依設定中的憑證與路徑建立解決器，順序與挑戰偏好一致。
///
/// TLS-ALPN-01 需要內嵌的 TLS 回應端，無法單靠設定建立，呼叫端需自行提供。
pub fn solvers_from_config(config: &AcmeConfig) -> Result<Vec<ChallengeSolver>> {
    let mut solvers = Vec::new();
    for kind in &config.challenge_preference {
        match kind {
            ChallengeType::Http01 => {
                if let Some(root) = &config.http01_webroot {
                    solvers.push(ChallengeSolver::Http01(Arc::new(WebrootProvisioner::new(root))));
                }
            }
            ChallengeType::Dns01 => {
                if let Some(token) = &config.cloudflare_token {
                    let provisioner = CloudflareProvisioner::new(token, config.request_timeout)?;
                    solvers.push(ChallengeSolver::Dns01(Arc::new(provisioner)));
                }
            }
            ChallengeType::TlsAlpn01 => {}
        }
    }
    Ok(solvers)
}
