use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::base64::Base64;

/// 載荷未通過驗證。
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid payload: {0}")]
pub struct PayloadError(pub String);

/// 定義所有 API 載荷（Payload）必須實作的功能。
pub trait PayloadT: Serialize {
    fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 將載荷先轉換成 JSON 字串，再以 Base64 進行編碼。
    fn to_base64(&self) -> Result<Base64, serde_json::Error> {
        Ok(Base64::new(self.to_json_string()?.as_bytes()))
    }

    /// 驗證載荷資料是否符合 ACME 的要求，在簽名前呼叫。
    fn validate(&self) -> Result<(), PayloadError>;
}

/// 表示一個識別項，用來描述證書所涵蓋的主機名稱。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            type_: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// newAccount 請求。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccountPayload {
    contact: Vec<String>,
    #[serde(rename = "termsOfServiceAgreed")]
    terms_of_service_agreed: bool,
    #[serde(rename = "onlyReturnExisting", default, skip_serializing_if = "is_false")]
    only_return_existing: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn mailto(email: &str) -> String {
    if email.starts_with("mailto:") {
        email.to_string()
    } else {
        format!("mailto:{}", email)
    }
}

fn validate_contacts(contact: &[String]) -> Result<(), PayloadError> {
    for entry in contact {
        let address = entry
            .strip_prefix("mailto:")
            .ok_or_else(|| PayloadError(format!("unsupported contact scheme: {}", entry)))?;
        match address.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
            _ => return Err(PayloadError(format!("invalid email address: {}", address))),
        }
    }
    Ok(())
}

impl NewAccountPayload {
    /// `email` 自動補上 `mailto:` 前綴。
    pub fn new(email: &str, terms_agreed: bool) -> Self {
        Self {
            contact: vec![mailto(email)],
            terms_of_service_agreed: terms_agreed,
            only_return_existing: false,
        }
    }

    /// 只查詢既有帳戶，不建立新帳戶。
    pub fn only_return_existing() -> Self {
        Self {
            contact: Vec::new(),
            terms_of_service_agreed: false,
            only_return_existing: true,
        }
    }
}

impl PayloadT for NewAccountPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.only_return_existing {
            return Ok(());
        }
        if self.contact.is_empty() {
            return Err(PayloadError("Contact information is required".into()));
        }
        validate_contacts(&self.contact)
    }
}

/// 更新帳戶聯絡資訊。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdatePayload {
    pub contact: Vec<String>,
}

impl AccountUpdatePayload {
    pub fn contact<S: AsRef<str>>(emails: &[S]) -> Self {
        Self {
            contact: emails.iter().map(|e| mailto(e.as_ref())).collect(),
        }
    }
}

impl PayloadT for AccountUpdatePayload {
    fn validate(&self) -> Result<(), PayloadError> {
        validate_contacts(&self.contact)
    }
}

/// 帳戶或授權停用：`{"status":"deactivated"}`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivatePayload {
    status: String,
}

impl Default for DeactivatePayload {
    fn default() -> Self {
        Self {
            status: "deactivated".to_string(),
        }
    }
}

impl PayloadT for DeactivatePayload {
    fn validate(&self) -> Result<(), PayloadError> {
        Ok(())
    }
}

/// 表示建立新訂單時所需的載荷資料。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

impl NewOrderPayload {
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        Self {
            identifiers: domains
                .iter()
                .map(|d| Identifier::dns(d.as_ref().trim().to_ascii_lowercase()))
                .collect(),
        }
    }
}

impl PayloadT for NewOrderPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.identifiers.is_empty() {
            return Err(PayloadError("At least one identifier is required".into()));
        }
        for (i, identifier) in self.identifiers.iter().enumerate() {
            if identifier.type_ != "dns" {
                return Err(PayloadError("Identifier type must be 'dns'".into()));
            }
            if identifier.value.is_empty() {
                return Err(PayloadError("Identifier value cannot be empty".into()));
            }
            if self.identifiers[..i].contains(identifier) {
                return Err(PayloadError(format!(
                    "Duplicate identifier: {}",
                    identifier.value
                )));
            }
        }
        Ok(())
    }
}

/// 通知伺服器開始驗證挑戰，內容為空物件。
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ChallengeValidationPayload {}

impl PayloadT for ChallengeValidationPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        Ok(())
    }
}

/// finalize 請求，CSR 為 DER 的 URL 安全 Base64。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    csr: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_der: &[u8]) -> Self {
        Self {
            csr: Base64::new(csr_der).base64_url(),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.csr.is_empty() {
            return Err(PayloadError("CSR is empty".into()));
        }
        Ok(())
    }
}

/// keyChange 內層 JWS 的載荷。
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyChangePayload {
    pub account: String,
    #[serde(rename = "oldKey")]
    pub old_key: Value,
}

impl PayloadT for KeyChangePayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.account.is_empty() {
            return Err(PayloadError("Account URL is required".into()));
        }
        if !self.old_key.is_object() {
            return Err(PayloadError("oldKey must be a JWK object".into()));
        }
        Ok(())
    }
}

/// revokeCert 請求。
#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeCertPayload {
    certificate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<u8>,
}

impl RevokeCertPayload {
    pub fn new(cert_der: &[u8], reason: Option<u8>) -> Self {
        Self {
            certificate: Base64::new(cert_der).base64_url(),
            reason,
        }
    }
}

impl PayloadT for RevokeCertPayload {
    /// RFC 5280 原因代碼，7 未使用。
    fn validate(&self) -> Result<(), PayloadError> {
        match self.reason {
            Some(7) | Some(11..) => Err(PayloadError(format!(
                "Invalid revocation reason: {:?}",
                self.reason
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_wire_format() -> Result<(), Box<dyn std::error::Error>> {
        let payload = NewAccountPayload::new("a@example.com", true);
        payload.validate()?;
        assert_eq!(
            payload.to_json_string()?,
            r#"{"contact":["mailto:a@example.com"],"termsOfServiceAgreed":true}"#
        );

        let lookup = NewAccountPayload::only_return_existing();
        lookup.validate()?;
        assert!(lookup.to_json_string()?.contains(r#""onlyReturnExisting":true"#));
        Ok(())
    }

    #[test]
    fn test_invalid_contact() {
        assert!(NewAccountPayload::new("not-an-email", true).validate().is_err());
        assert!(AccountUpdatePayload::contact(&["tel:+123"]).validate().is_err());
    }

    #[test]
    fn test_new_order_validation() {
        assert!(NewOrderPayload::new(&["a.example", "b.example"]).validate().is_ok());
        assert!(NewOrderPayload::new::<&str>(&[]).validate().is_err());
        assert!(NewOrderPayload::new(&["a.example", "A.example"]).validate().is_err());
        assert!(NewOrderPayload::new(&[""]).validate().is_err());
    }

    #[test]
    fn test_empty_payloads() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(ChallengeValidationPayload::default().to_json_string()?, "{}");
        assert_eq!(
            DeactivatePayload::default().to_json_string()?,
            r#"{"status":"deactivated"}"#
        );
        Ok(())
    }

    #[test]
    fn test_revocation_reason() {
        assert!(RevokeCertPayload::new(b"der", None).validate().is_ok());
        assert!(RevokeCertPayload::new(b"der", Some(1)).validate().is_ok());
        assert!(RevokeCertPayload::new(b"der", Some(7)).validate().is_err());
        assert!(RevokeCertPayload::new(b"der", Some(12)).validate().is_err());
    }
}
