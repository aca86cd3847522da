//! Cloudflare DNS API 的 DNS-01 發佈實作。

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use reqwest::blocking::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::solver::{ProofRecord, ProvisionError, Provisioner, Result};

pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";
/// TXT 記錄的 TTL（秒）。
const TXT_RECORD_TTL: u32 = 60;

/// 以 API Token 操作 Cloudflare 上的 `_acme-challenge` TXT 記錄。
pub struct CloudflareProvisioner {
    client: Client,
    token: String,
    api_base: String,
    zones: Mutex<HashMap<String, String>>,
    /// (記錄名稱, 記錄值) 對應的 Cloudflare 記錄 ID。
    records: Mutex<HashMap<(String, String), String>>,
}

impl fmt::Debug for CloudflareProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudflareProvisioner")
            .field("api_base", &self.api_base)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl CloudflareProvisioner {
    pub fn new(token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token: token.to_string(),
            api_base: CLOUDFLARE_API_BASE.to_string(),
            zones: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
        })
    }

    /// 改用其他 API 端點，例如相容的代理。
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.token))
    }

    fn zones(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
        self.zones.lock().map_err(|_| ProvisionError::LockPoisoned)
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<(String, String), String>>> {
        self.records.lock().map_err(|_| ProvisionError::LockPoisoned)
    }

    /// 由最長的候選名稱往上找出網域所屬的 zone。
    fn zone_id(&self, domain: &str) -> Result<String> {
        let domain = domain.trim_start_matches("*.");
        if let Some(id) = self.zones()?.get(domain) {
            return Ok(id.clone());
        }
        for candidate in candidate_zones(domain) {
            let url = format!("{}/zones?name={}", self.api_base, candidate);
            let zones: Vec<CloudflareZone> = parse(self.authorized(self.client.get(&url)).send()?)?;
            if let Some(zone) = zones.into_iter().next() {
                debug!(domain, zone = candidate, "Resolved Cloudflare zone");
                self.zones()?.insert(domain.to_string(), zone.id.clone());
                return Ok(zone.id);
            }
        }
        Err(ProvisionError::Api(format!("Zone not found for {}", domain)))
    }

    fn list_txt_records(&self, zone_id: &str, name: &str) -> Result<Vec<CloudflareDnsRecordItem>> {
        let url = format!(
            "{}/zones/{}/dns_records?type=TXT&name={}",
            self.api_base, zone_id, name
        );
        parse(self.authorized(self.client.get(&url)).send()?)
    }

    fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        let url = format!("{}/zones/{}/dns_records/{}", self.api_base, zone_id, record_id);
        let response = self.authorized(self.client.delete(&url)).send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        parse::<serde_json::Value>(response).map(|_| ())
    }

    fn create_txt_record(&self, zone_id: &str, name: &str, value: &str) -> Result<String> {
        let url = format!("{}/zones/{}/dns_records", self.api_base, zone_id);
        let record = CloudflareDnsRecord {
            record_type: "TXT",
            name,
            content: format!("\"{}\"", value),
            ttl: TXT_RECORD_TTL,
        };
        let created: CloudflareDnsRecordItem =
            parse(self.authorized(self.client.post(&url)).json(&record).send()?)?;
        Ok(created.id)
    }

    fn txt_fields(record: &ProofRecord) -> Result<(&str, &str, &str)> {
        match record {
            ProofRecord::DnsTxt {
                domain,
                name,
                value,
            } => Ok((domain, name, value)),
            other => Err(ProvisionError::Unsupported {
                provisioner: "cloudflare",
                record: other.kind(),
            }),
        }
    }
}

impl Provisioner for CloudflareProvisioner {
    fn publish(&self, record: &ProofRecord) -> Result<()> {
        let (domain, name, value) = Self::txt_fields(record)?;
        let zone_id = self.zone_id(domain)?;
        let id = self.create_txt_record(&zone_id, name, value)?;
        info!(domain, record = name, "Created Cloudflare TXT record");
        self.records()?
            .insert((name.to_string(), value.to_string()), id);
        Ok(())
    }

    fn remove(&self, record: &ProofRecord) -> Result<()> {
        let (domain, name, value) = Self::txt_fields(record)?;
        let zone_id = self.zone_id(domain)?;
        let known = self
            .records()?
            .remove(&(name.to_string(), value.to_string()));
        match known {
            Some(id) => self.delete_record(&zone_id, &id)?,
            None => {
                for item in self.list_txt_records(&zone_id, name)? {
                    if item.content.trim_matches('"') == value {
                        self.delete_record(&zone_id, &item.id)?;
                    }
                }
            }
        }
        debug!(domain, record = name, "Removed Cloudflare TXT record");
        Ok(())
    }
}

/// `a.b.example.com` 依序產生 `a.b.example.com`、`b.example.com`、`example.com`。
fn candidate_zones(domain: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut rest = domain;
    while rest.contains('.') {
        candidates.push(rest);
        match rest.split_once('.') {
            Some((_, parent)) => rest = parent,
            None => break,
        }
    }
    candidates
}

fn parse<T: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T> {
    let envelope: CloudflareResponse<T> = response.json()?;
    envelope.into_result()
}

/// 將 Cloudflare 回傳的錯誤組合成單一字串。
fn format_cloudflare_errors(errors: &[CloudflareError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Serialize)]
struct CloudflareDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: String,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    errors: Vec<CloudflareError>,
}

impl<T> CloudflareResponse<T> {
    fn into_result(self) -> Result<T> {
        if !self.success {
            return Err(ProvisionError::Api(format_cloudflare_errors(&self.errors)));
        }
        self.result
            .ok_or_else(|| ProvisionError::Api("Missing result in Cloudflare response".into()))
    }
}

#[derive(Debug, Deserialize)]
struct CloudflareDnsRecordItem {
    id: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareZone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    code: u32,
    message: String,
}
