//! 單元測試用的記憶體內 ACME 伺服器。
//!
//! 驗證每個 JWS 的簽名、nonce 與 `url` 保護頭，並依網域設定的行為推進授權狀態。

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey, EcKeyRef},
    ecdsa::EcdsaSig,
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
    sha::sha256,
    sign::Verifier,
    x509::{
        extension::{BasicConstraints, SubjectAlternativeName},
        X509NameBuilder, X509Req, X509,
    },
};
use serde_json::{json, Value};

use crate::{
    base64::Base64,
    challenge::ChallengeType,
    client::AcmeClient,
    clock::{Clock, ManualClock},
    config::AcmeConfig,
    directory::DirectoryResolver,
    http::{HttpClient, HttpError, HttpResponse, PROBLEM_CONTENT_TYPE},
    jws::Jws,
    problem::Problem,
};

pub const BASE_URL: &str = "https://acme-staging.example";
pub const DIRECTORY_URL: &str = "https://acme-staging.example/directory";
pub const NEW_NONCE_URL: &str = "https://acme-staging.example/new-nonce";
pub const NEW_ACCOUNT_URL: &str = "https://acme-staging.example/new-account";
pub const NEW_ORDER_URL: &str = "https://acme-staging.example/new-order";
pub const REVOKE_CERT_URL: &str = "https://acme-staging.example/revoke-cert";
pub const KEY_CHANGE_URL: &str = "https://acme-staging.example/key-change";
pub const TERMS_URL: &str = "https://acme-staging.example/terms";
/// 永遠回應 410 Gone 的端點。
pub const GONE_URL: &str = "https://acme-staging.example/gone";

/// 觸發挑戰後，下一次查詢授權時的結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Succeed,
    Fail,
    /// 授權永遠停在 pending。
    Stall,
}

/// ES256 原始 `r || s` 簽章驗證。
pub(crate) fn verify_es256(data: &[u8], signature: &[u8], key: &EcKeyRef<Public>) -> bool {
    if signature.len() != 64 {
        return false;
    }
    let (Ok(r), Ok(s)) = (
        BigNum::from_slice(&signature[..32]),
        BigNum::from_slice(&signature[32..]),
    ) else {
        return false;
    };
    let Ok(sig) = EcdsaSig::from_private_components(r, s) else {
        return false;
    };
    sig.verify(&sha256(data), key).unwrap_or(false)
}

fn verify_jws_signature(key: &PKey<Public>, data: &[u8], signature: &[u8]) -> bool {
    match key.id() {
        Id::EC => key
            .ec_key()
            .map(|ec| verify_es256(data, signature, &ec))
            .unwrap_or(false),
        Id::RSA => Verifier::new(MessageDigest::sha256(), key)
            .and_then(|mut v| {
                v.update(data)?;
                v.verify(signature)
            })
            .unwrap_or(false),
        _ => false,
    }
}

fn public_key_from_jwk(jwk: &Value) -> Option<PKey<Public>> {
    let field = |name: &str| -> Option<BigNum> {
        let encoded = jwk.get(name)?.as_str()?;
        BigNum::from_slice(Base64::from_url(encoded).ok()?.as_bytes()).ok()
    };
    match jwk.get("kty")?.as_str()? {
        "EC" => {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).ok()?;
            let (x, y) = (field("x")?, field("y")?);
            let ec = EcKey::from_public_key_affine_coordinates(&group, &x, &y).ok()?;
            PKey::from_ec_key(ec).ok()
        }
        "RSA" => {
            let rsa = Rsa::from_public_components(field("n")?, field("e")?).ok()?;
            PKey::from_rsa(rsa).ok()
        }
        _ => None,
    }
}

fn jwk_thumbprint(jwk: &Value) -> String {
    let s = |name: &str| jwk[name].as_str().unwrap_or_default().to_string();
    let canonical = if jwk["kty"] == "RSA" {
        format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, s("e"), s("n"))
    } else {
        format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            s("crv"),
            s("x"),
            s("y")
        )
    };
    Base64::new(sha256(canonical.as_bytes())).base64_url()
}

fn decode_json(part: &str) -> Option<Value> {
    serde_json::from_slice(Base64::from_url(part).ok()?.as_bytes()).ok()
}

struct MockAccount {
    key: PKey<Public>,
    thumbprint: String,
    status: &'static str,
    contact: Value,
}

impl MockAccount {
    fn to_json(&self, url: &str) -> Value {
        json!({
            "status": self.status,
            "contact": self.contact,
            "orders": format!("{}/orders", url),
        })
    }
}

struct MockChallenge {
    kind: ChallengeType,
    status: &'static str,
    error: Option<Problem>,
}

struct MockAuthz {
    domain: String,
    wildcard: bool,
    status: &'static str,
    challenges: Vec<MockChallenge>,
}

impl MockAuthz {
    fn to_json(&self, id: usize) -> Value {
        let challenges: Vec<Value> = self
            .challenges
            .iter()
            .map(|c| {
                let mut value = json!({
                    "type": c.kind.as_str(),
                    "url": format!("{}/chall/{}/{}", BASE_URL, id, c.kind),
                    "status": c.status,
                    "token": format!("token-{}-{}", id, c.kind),
                });
                if let Some(error) = &c.error {
                    value["error"] = json!(error);
                }
                value
            })
            .collect();
        json!({
            "identifier": {"type": "dns", "value": self.domain},
            "status": self.status,
            "expires": "2030-01-01T00:00:00Z",
            "challenges": challenges,
            "wildcard": self.wildcard,
        })
    }
}

struct MockOrder {
    account: String,
    status: &'static str,
    identifiers: Vec<String>,
    authzs: Vec<usize>,
    csr_key: Option<PKey<Public>>,
    certificate: Option<usize>,
}

struct IssuedCert {
    leaf: X509,
    revoked: bool,
}

#[derive(Default)]
struct State {
    next_id: usize,
    issued_nonces: HashSet<String>,
    accounts: HashMap<String, MockAccount>,
    orders: HashMap<usize, MockOrder>,
    authzs: HashMap<usize, MockAuthz>,
    certs: HashMap<usize, IssuedCert>,
    behaviors: HashMap<String, Behavior>,
    pre_valid: HashSet<String>,
    triggered: Vec<(String, ChallengeType)>,
    deactivated: Vec<String>,
    registration_error: Option<(Problem, Option<u64>)>,
}

impl State {
    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn order_json(&self, id: usize) -> Value {
        let order = &self.orders[&id];
        let mut value = json!({
            "status": order.status,
            "expires": "2030-01-01T00:00:00Z",
            "identifiers": order
                .identifiers
                .iter()
                .map(|d| json!({"type": "dns", "value": d}))
                .collect::<Vec<_>>(),
            "authorizations": order
                .authzs
                .iter()
                .map(|a| format!("{}/authz/{}", BASE_URL, a))
                .collect::<Vec<_>>(),
            "finalize": format!("{}/order/{}/finalize", BASE_URL, id),
        });
        if let Some(cert) = order.certificate {
            value["certificate"] = json!(format!("{}/cert/{}", BASE_URL, cert));
        }
        if order.status == "invalid" {
            value["error"] = json!(Problem::acme("unauthorized", "authorization failed", 403));
        }
        value
    }

    /// 觸發過的挑戰在查詢時依網域行為決定結果。
    fn advance_authz(&mut self, id: usize) {
        let Some(authz) = self.authzs.get_mut(&id) else {
            return;
        };
        if authz.status != "pending" {
            return;
        }
        let behavior = self.behaviors.get(&authz.domain).copied().unwrap_or_default();
        let Some(challenge) = authz.challenges.iter_mut().find(|c| c.status == "processing") else {
            return;
        };
        match behavior {
            Behavior::Succeed => {
                challenge.status = "valid";
                authz.status = "valid";
            }
            Behavior::Fail => {
                challenge.status = "invalid";
                challenge.error = Some(Problem::acme(
                    "incorrectResponse",
                    format!("key authorization mismatch for {}", authz.domain),
                    403,
                ));
                authz.status = "invalid";
            }
            Behavior::Stall => {}
        }
    }

    fn refresh_order(&mut self, id: usize, ca: &MockCa) {
        let authz_ids = self.orders[&id].authzs.clone();
        for a in &authz_ids {
            self.advance_authz(*a);
        }
        let statuses: Vec<&str> = authz_ids.iter().map(|a| self.authzs[a].status).collect();
        let cert_id = self.next_id + 1;
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        match order.status {
            "pending" => {
                if statuses.iter().any(|s| *s != "pending" && *s != "valid") {
                    order.status = "invalid";
                } else if statuses.iter().all(|s| *s == "valid") {
                    order.status = "ready";
                }
            }
            "processing" => {
                let Some(key) = order.csr_key.take() else {
                    return;
                };
                let leaf = ca.issue(&key, &order.identifiers, cert_id as u32);
                order.certificate = Some(cert_id);
                order.status = "valid";
                self.next_id = cert_id;
                self.certs.insert(
                    cert_id,
                    IssuedCert {
                        leaf,
                        revoked: false,
                    },
                );
            }
            _ => {}
        }
    }
}

/// 自簽的 P-256 測試 CA。
struct MockCa {
    key: PKey<Private>,
    cert: X509,
}

impl MockCa {
    fn new() -> Self {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("group");
        let key = PKey::from_ec_key(EcKey::generate(&group).expect("ca key")).expect("pkey");
        let mut name = X509NameBuilder::new().expect("name");
        name.append_entry_by_text("CN", "Mock ACME Root").expect("cn");
        let name = name.build();

        let mut builder = X509::builder().expect("builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_u32(1).and_then(|b| b.to_asn1_integer()).expect("serial");
        builder.set_serial_number(&serial).expect("serial");
        builder.set_subject_name(&name).expect("subject");
        builder.set_issuer_name(&name).expect("issuer");
        builder.set_pubkey(&key).expect("pubkey");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("time"))
            .expect("not before");
        builder
            .set_not_after(&Asn1Time::days_from_now(3650).expect("time"))
            .expect("not after");
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().expect("bc"))
            .expect("extension");
        builder.sign(&key, MessageDigest::sha256()).expect("sign");
        Self {
            key,
            cert: builder.build(),
        }
    }

    fn issue(&self, subject_key: &PKey<Public>, domains: &[String], serial: u32) -> X509 {
        let mut builder = X509::builder().expect("builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_u32(serial + 100)
            .and_then(|b| b.to_asn1_integer())
            .expect("serial");
        builder.set_serial_number(&serial).expect("serial");
        let mut name = X509NameBuilder::new().expect("name");
        name.append_entry_by_text("CN", &domains[0]).expect("cn");
        let name = name.build();
        builder.set_subject_name(&name).expect("subject");
        builder
            .set_issuer_name(self.cert.subject_name())
            .expect("issuer");
        builder.set_pubkey(subject_key).expect("pubkey");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("time"))
            .expect("not before");
        builder
            .set_not_after(&Asn1Time::days_from_now(90).expect("time"))
            .expect("not after");
        let mut san = SubjectAlternativeName::new();
        for domain in domains {
            san.dns(domain);
        }
        let san = san
            .build(&builder.x509v3_context(Some(&*self.cert), None))
            .expect("san");
        builder.append_extension(san).expect("extension");
        builder.sign(&self.key, MessageDigest::sha256()).expect("sign");
        builder.build()
    }
}

/// 實作 [`HttpClient`] 的模擬 ACME 伺服器。
pub struct MockAcmeServer {
    state: Mutex<State>,
    ca: MockCa,
    nonce_counter: AtomicUsize,
    requests: AtomicUsize,
    directory_fetches: AtomicUsize,
    nonce_fetches: AtomicUsize,
    fail_next: AtomicUsize,
    reject_nonces: AtomicUsize,
    directory_delay: Mutex<Duration>,
}

impl std::fmt::Debug for MockAcmeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAcmeServer").finish_non_exhaustive()
    }
}

type Handled = std::result::Result<HttpResponse, HttpResponse>;

impl MockAcmeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            ca: MockCa::new(),
            nonce_counter: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            directory_fetches: AtomicUsize::new(0),
            nonce_fetches: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            reject_nonces: AtomicUsize::new(0),
            directory_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn directory_fetches(&self) -> usize {
        self.directory_fetches.load(Ordering::SeqCst)
    }

    pub fn nonce_fetches(&self) -> usize {
        self.nonce_fetches.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn set_directory_delay(&self, delay: Duration) {
        *self.directory_delay.lock().expect("delay lock") = delay;
    }

    /// 接下來 `n` 個請求（任何方法）以連線錯誤失敗。
    pub fn fail_next_requests(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// 接下來 `n` 個 POST 無論 nonce 是否有效都回應 badNonce。
    pub fn reject_nonces(&self, n: usize) {
        self.reject_nonces.store(n, Ordering::SeqCst);
    }

    /// 下一次 newAccount 回應指定的問題文件。
    pub fn reject_registrations(&self, problem: Problem, retry_after: Option<u64>) {
        self.state().registration_error = Some((problem, retry_after));
    }

    pub fn set_behavior(&self, domain: &str, behavior: Behavior) {
        self.state().behaviors.insert(domain.to_string(), behavior);
    }

    /// 之後為 `domain` 建立的授權一開始就是 valid。
    pub fn set_pre_valid(&self, domain: &str) {
        self.state().pre_valid.insert(domain.to_string());
    }

    pub fn triggered_challenges(&self) -> Vec<(String, ChallengeType)> {
        self.state().triggered.clone()
    }

    pub fn deactivated_authorizations(&self) -> Vec<String> {
        self.state().deactivated.clone()
    }

    pub fn account_count(&self) -> usize {
        self.state().accounts.len()
    }

    pub fn account_status(&self, url: &str) -> Option<&'static str> {
        self.state().accounts.get(url).map(|a| a.status)
    }

    /// 帳戶目前使用的金鑰 thumbprint。
    pub fn account_thumbprint(&self, url: &str) -> Option<String> {
        self.state().accounts.get(url).map(|a| a.thumbprint.clone())
    }

    pub fn is_revoked(&self, cert_der: &[u8]) -> bool {
        self.state()
            .certs
            .values()
            .any(|c| c.revoked && c.leaf.to_der().map(|d| d == cert_der).unwrap_or(false))
    }

    pub fn ca_certificate(&self) -> X509 {
        self.ca.cert.clone()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arrive(&self) -> Result<(), HttpError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(HttpError::Unavailable("injected connection failure".into()));
        }
        Ok(())
    }

    fn fresh_nonce(&self, state: &mut State) -> String {
        let nonce = format!("nonce-{}", self.nonce_counter.fetch_add(1, Ordering::SeqCst));
        state.issued_nonces.insert(nonce.clone());
        nonce
    }

    fn reply(&self, state: &mut State, status: u16, body: Option<Value>) -> HttpResponse {
        let mut response =
            HttpResponse::new(status).with_header("Replay-Nonce", self.fresh_nonce(state));
        if let Some(body) = body {
            response = response
                .with_header("Content-Type", "application/json")
                .with_body(body.to_string());
        }
        response
    }

    fn problem(&self, state: &mut State, status: u16, name: &str, detail: &str) -> HttpResponse {
        let problem = Problem::acme(name, detail, status);
        HttpResponse::new(status)
            .with_header("Replay-Nonce", self.fresh_nonce(state))
            .with_header("Content-Type", PROBLEM_CONTENT_TYPE)
            .with_body(json!(problem).to_string())
    }

    fn directory(&self) -> HttpResponse {
        let body = json!({
            "newNonce": NEW_NONCE_URL,
            "newAccount": NEW_ACCOUNT_URL,
            "newOrder": NEW_ORDER_URL,
            "revokeCert": REVOKE_CERT_URL,
            "keyChange": KEY_CHANGE_URL,
            "meta": {"termsOfService": TERMS_URL, "website": BASE_URL},
        });
        HttpResponse::new(200)
            .with_header("Content-Type", "application/json")
            .with_body(body.to_string())
    }

    fn handle_post(&self, url: &str, body: &str) -> HttpResponse {
        let mut state = self.state();
        match self.dispatch(&mut state, url, body) {
            Ok(response) | Err(response) => response,
        }
    }

    fn dispatch(&self, state: &mut State, url: &str, body: &str) -> Handled {
        let jws: Jws = serde_json::from_str(body)
            .map_err(|_| self.problem(state, 400, "malformed", "request is not a JWS"))?;
        let header = decode_json(jws.protected())
            .ok_or_else(|| self.problem(state, 400, "malformed", "bad protected header"))?;

        let nonce = header["nonce"].as_str().unwrap_or_default().to_string();
        let injected = self
            .reject_nonces
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !state.issued_nonces.remove(&nonce) || injected {
            return Err(self.problem(state, 400, "badNonce", "unknown or reused nonce"));
        }
        if header["url"] != url {
            return Err(self.problem(state, 401, "unauthorized", "url header mismatch"));
        }
        if url == GONE_URL {
            return Ok(self.reply(state, 410, None));
        }

        let (key, account_url) = if let Some(jwk) = header.get("jwk") {
            if url != NEW_ACCOUNT_URL {
                return Err(self.problem(state, 400, "malformed", "jwk only allowed for newAccount"));
            }
            let key = public_key_from_jwk(jwk)
                .ok_or_else(|| self.problem(state, 400, "badPublicKey", "unusable jwk"))?;
            (key, None)
        } else {
            let kid = header["kid"].as_str().unwrap_or_default().to_string();
            let Some(account) = state.accounts.get(&kid) else {
                return Err(self.problem(state, 400, "accountDoesNotExist", "unknown kid"));
            };
            if account.status != "valid" {
                return Err(self.problem(state, 401, "unauthorized", "account is not valid"));
            }
            (account.key.clone(), Some(kid))
        };

        let input = format!("{}.{}", jws.protected(), jws.payload());
        let signature = Base64::from_url(jws.signature()).map(Base64::into_bytes).unwrap_or_default();
        if !verify_jws_signature(&key, input.as_bytes(), &signature) {
            return Err(self.problem(state, 400, "malformed", "signature verification failed"));
        }
        let payload = if jws.payload().is_empty() {
            None
        } else {
            Some(
                decode_json(jws.payload())
                    .ok_or_else(|| self.problem(state, 400, "malformed", "bad payload"))?,
            )
        };

        let Some(account_url) = account_url else {
            let jwk = header["jwk"].clone();
            return self.new_account(state, key, &jwk, payload);
        };
        let path = url.strip_prefix(BASE_URL).unwrap_or(url).to_string();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["new-order"] => self.new_order(state, &account_url, payload),
            ["acct", _] => self.account(state, &account_url, url, payload),
            ["order", id] => {
                let id = self.order_id(state, &account_url, id)?;
                self.ca_refresh(state, id);
                let body = state.order_json(id);
                Ok(self.reply(state, 200, Some(body)).with_header("Location", url))
            }
            ["order", id, "finalize"] => {
                let id = self.order_id(state, &account_url, id)?;
                self.finalize(state, id, payload)
            }
            ["authz", id] => self.authorization(state, id, payload),
            ["chall", id, kind] => self.challenge(state, id, kind, payload),
            ["cert", id] => {
                let cert = id
                    .parse::<usize>()
                    .ok()
                    .and_then(|id| state.certs.get(&id))
                    .map(|c| c.leaf.clone())
                    .ok_or_else(|| self.problem(state, 404, "malformed", "no such certificate"))?;
                let mut pem = cert.to_pem().expect("leaf pem");
                pem.extend(self.ca.cert.to_pem().expect("ca pem"));
                Ok(HttpResponse::new(200)
                    .with_header("Replay-Nonce", self.fresh_nonce(state))
                    .with_header("Content-Type", "application/pem-certificate-chain")
                    .with_body(pem))
            }
            ["revoke-cert"] => self.revoke(state, payload),
            ["key-change"] => self.key_change(state, &account_url, payload),
            _ => Err(self.problem(state, 404, "malformed", "no such resource")),
        }
    }

    fn ca_refresh(&self, state: &mut State, id: usize) {
        state.refresh_order(id, &self.ca);
    }

    fn new_account(
        &self,
        state: &mut State,
        key: PKey<Public>,
        jwk: &Value,
        payload: Option<Value>,
    ) -> Handled {
        let payload = payload.unwrap_or_default();
        if let Some((problem, retry_after)) = state.registration_error.take() {
            let status = problem.status.unwrap_or(400);
            let mut response = HttpResponse::new(status)
                .with_header("Replay-Nonce", self.fresh_nonce(state))
                .with_header("Content-Type", PROBLEM_CONTENT_TYPE)
                .with_body(json!(problem).to_string());
            if let Some(secs) = retry_after {
                response = response.with_header("Retry-After", secs.to_string());
            }
            return Err(response);
        }

        let thumbprint = jwk_thumbprint(jwk);
        let existing = state
            .accounts
            .iter()
            .find(|(_, a)| a.thumbprint == thumbprint)
            .map(|(url, a)| (url.clone(), a.to_json(url)));
        if let Some((url, body)) = existing {
            return Ok(self.reply(state, 200, Some(body)).with_header("Location", url));
        }
        if payload["onlyReturnExisting"] == true {
            return Err(self.problem(state, 400, "accountDoesNotExist", "no account for this key"));
        }
        if payload["termsOfServiceAgreed"] != true {
            return Err(self.problem(state, 403, "userActionRequired", "terms of service must be agreed"));
        }

        let id = state.next_id();
        let url = format!("{}/acct/{}", BASE_URL, id);
        let account = MockAccount {
            key,
            thumbprint,
            status: "valid",
            contact: payload["contact"].clone(),
        };
        let body = account.to_json(&url);
        state.accounts.insert(url.clone(), account);
        Ok(self.reply(state, 201, Some(body)).with_header("Location", url))
    }

    fn account(&self, state: &mut State, kid: &str, url: &str, payload: Option<Value>) -> Handled {
        if kid != url {
            return Err(self.problem(state, 403, "unauthorized", "not your account"));
        }
        let Some(account) = state.accounts.get_mut(url) else {
            return Err(self.problem(state, 404, "accountDoesNotExist", "no such account"));
        };
        if let Some(payload) = payload {
            if payload["status"] == "deactivated" {
                account.status = "deactivated";
            }
            if let Some(contact) = payload.get("contact") {
                account.contact = contact.clone();
            }
        }
        let body = account.to_json(url);
        Ok(self.reply(state, 200, Some(body)).with_header("Location", url))
    }

    fn new_order(&self, state: &mut State, account: &str, payload: Option<Value>) -> Handled {
        let identifiers: Vec<String> = payload
            .as_ref()
            .and_then(|p| p["identifiers"].as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|i| i["value"].as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if identifiers.is_empty() {
            return Err(self.problem(state, 400, "malformed", "no identifiers"));
        }

        let mut authzs = Vec::new();
        for value in &identifiers {
            let wildcard = value.starts_with("*.");
            let domain = value.trim_start_matches("*.").to_string();
            let status = if state.pre_valid.contains(&domain) {
                "valid"
            } else {
                "pending"
            };
            let kinds: &[ChallengeType] = if wildcard {
                &[ChallengeType::Dns01]
            } else {
                &[
                    ChallengeType::Http01,
                    ChallengeType::Dns01,
                    ChallengeType::TlsAlpn01,
                ]
            };
            let id = state.next_id();
            state.authzs.insert(
                id,
                MockAuthz {
                    domain,
                    wildcard,
                    status,
                    challenges: kinds
                        .iter()
                        .map(|kind| MockChallenge {
                            kind: *kind,
                            status: if status == "valid" { "valid" } else { "pending" },
                            error: None,
                        })
                        .collect(),
                },
            );
            authzs.push(id);
        }

        let id = state.next_id();
        state.orders.insert(
            id,
            MockOrder {
                account: account.to_string(),
                status: "pending",
                identifiers,
                authzs,
                csr_key: None,
                certificate: None,
            },
        );
        self.ca_refresh(state, id);
        let body = state.order_json(id);
        Ok(self
            .reply(state, 201, Some(body))
            .with_header("Location", format!("{}/order/{}", BASE_URL, id)))
    }

    fn order_id(&self, state: &mut State, account: &str, id: &str) -> Result<usize, HttpResponse> {
        match id.parse::<usize>().ok().filter(|id| state.orders.contains_key(id)) {
            Some(id) if state.orders[&id].account == account => Ok(id),
            Some(_) => Err(self.problem(state, 403, "unauthorized", "order belongs to another account")),
            None => Err(self.problem(state, 404, "malformed", "no such order")),
        }
    }

    fn finalize(&self, state: &mut State, id: usize, payload: Option<Value>) -> Handled {
        self.ca_refresh(state, id);
        if state.orders[&id].status != "ready" {
            return Err(self.problem(state, 403, "orderNotReady", "order is not ready"));
        }
        let csr = payload
            .as_ref()
            .and_then(|p| p["csr"].as_str())
            .and_then(|c| Base64::from_url(c).ok())
            .and_then(|der| X509Req::from_der(der.as_bytes()).ok());
        let key = csr.and_then(|req| {
            let key = req.public_key().ok()?;
            req.verify(&key).ok().filter(|ok| *ok).map(|_| key)
        });
        let Some(key) = key else {
            return Err(self.problem(state, 400, "badCSR", "CSR could not be verified"));
        };
        if let Some(order) = state.orders.get_mut(&id) {
            order.status = "processing";
            order.csr_key = Some(key);
        }
        let body = state.order_json(id);
        Ok(self
            .reply(state, 200, Some(body))
            .with_header("Location", format!("{}/order/{}", BASE_URL, id)))
    }

    fn authorization(&self, state: &mut State, id: &str, payload: Option<Value>) -> Handled {
        let Some(id) = id.parse::<usize>().ok().filter(|id| state.authzs.contains_key(id)) else {
            return Err(self.problem(state, 404, "malformed", "no such authorization"));
        };
        if payload.as_ref().is_some_and(|p| p["status"] == "deactivated") {
            if let Some(authz) = state.authzs.get_mut(&id) {
                authz.status = "deactivated";
                let domain = authz.domain.clone();
                state.deactivated.push(domain);
            }
        } else {
            state.advance_authz(id);
        }
        let body = state.authzs[&id].to_json(id);
        Ok(self.reply(state, 200, Some(body)))
    }

    fn challenge(&self, state: &mut State, id: &str, kind: &str, payload: Option<Value>) -> Handled {
        let id = id.parse::<usize>().ok();
        let kind = kind.parse::<ChallengeType>().ok();
        let (Some(id), Some(kind)) = (id, kind) else {
            return Err(self.problem(state, 404, "malformed", "no such challenge"));
        };
        let Some(authz) = state.authzs.get_mut(&id) else {
            return Err(self.problem(state, 404, "malformed", "no such challenge"));
        };
        let domain = authz.domain.clone();
        let authz_pending = authz.status == "pending";
        let Some(challenge) = authz.challenges.iter_mut().find(|c| c.kind == kind) else {
            return Err(self.problem(state, 404, "malformed", "no such challenge"));
        };
        if payload.is_some() && authz_pending && challenge.status == "pending" {
            challenge.status = "processing";
            state.triggered.push((domain, kind));
        }
        let body = state.authzs[&id].to_json(id)["challenges"]
            .as_array()
            .and_then(|cs| cs.iter().find(|c| c["type"] == kind.as_str()).cloned())
            .unwrap_or_default();
        Ok(self.reply(state, 200, Some(body)))
    }

    fn revoke(&self, state: &mut State, payload: Option<Value>) -> Handled {
        let der = payload
            .as_ref()
            .and_then(|p| p["certificate"].as_str())
            .and_then(|c| Base64::from_url(c).ok())
            .map(Base64::into_bytes)
            .unwrap_or_default();
        let already_revoked = state
            .certs
            .values_mut()
            .find(|c| c.leaf.to_der().map(|d| d == der).unwrap_or(false))
            .map(|c| std::mem::replace(&mut c.revoked, true));
        match already_revoked {
            None => Err(self.problem(state, 404, "malformed", "unknown certificate")),
            Some(true) => Err(self.problem(state, 400, "alreadyRevoked", "certificate already revoked")),
            Some(false) => Ok(self.reply(state, 200, None)),
        }
    }

    fn key_change(&self, state: &mut State, account_url: &str, payload: Option<Value>) -> Handled {
        let inner: Option<Jws> = payload.and_then(|p| serde_json::from_value(p).ok());
        let Some(inner) = inner else {
            return Err(self.problem(state, 400, "malformed", "keyChange payload must be a JWS"));
        };
        let header = decode_json(inner.protected()).unwrap_or_default();
        if header.get("nonce").is_some() || header["url"] != KEY_CHANGE_URL {
            return Err(self.problem(state, 400, "malformed", "bad inner protected header"));
        }
        let new_key = header.get("jwk").and_then(public_key_from_jwk);
        let Some(new_key) = new_key else {
            return Err(self.problem(state, 400, "malformed", "inner JWS must carry jwk"));
        };
        let input = format!("{}.{}", inner.protected(), inner.payload());
        let signature = Base64::from_url(inner.signature()).map(Base64::into_bytes).unwrap_or_default();
        if !verify_jws_signature(&new_key, input.as_bytes(), &signature) {
            return Err(self.problem(state, 400, "malformed", "inner signature invalid"));
        }
        let body = decode_json(inner.payload()).unwrap_or_default();
        let old_thumbprint = jwk_thumbprint(&body["oldKey"]);
        let new_thumbprint = jwk_thumbprint(&header["jwk"]);
        let current = state.accounts.get(account_url).map(|a| a.thumbprint.clone());
        if body["account"] != account_url || current.as_deref() != Some(old_thumbprint.as_str()) {
            return Err(self.problem(state, 403, "unauthorized", "keyChange does not match account"));
        }
        if state.accounts.values().any(|a| a.thumbprint == new_thumbprint) {
            return Err(self.problem(state, 409, "malformed", "new key already in use"));
        }
        let Some(account) = state.accounts.get_mut(account_url) else {
            return Err(self.problem(state, 404, "accountDoesNotExist", "no such account"));
        };
        account.key = new_key;
        account.thumbprint = new_thumbprint;
        let body = account.to_json(account_url);
        Ok(self.reply(state, 200, Some(body)))
    }

    fn nonce_response(&self, status: u16) -> HttpResponse {
        self.nonce_fetches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        self.reply(&mut state, status, None)
    }
}

impl HttpClient for MockAcmeServer {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.arrive()?;
        match url {
            DIRECTORY_URL => {
                self.directory_fetches.fetch_add(1, Ordering::SeqCst);
                let delay = *self.directory_delay.lock().expect("delay lock");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                Ok(self.directory())
            }
            NEW_NONCE_URL => Ok(self.nonce_response(204)),
            _ => Ok(HttpResponse::new(404)),
        }
    }

    fn head(&self, url: &str) -> Result<HttpResponse, HttpError> {
        self.arrive()?;
        match url {
            NEW_NONCE_URL => Ok(self.nonce_response(200)),
            _ => Ok(HttpResponse::new(405)),
        }
    }

    fn post_jose(&self, url: &str, body: String) -> Result<HttpResponse, HttpError> {
        self.arrive()?;
        Ok(self.handle_post(url, &body))
    }
}

/// 指向模擬伺服器、其餘為預設值的設定。
pub fn test_config() -> AcmeConfig {
    AcmeConfig::builder()
        .directory_url(DIRECTORY_URL)
        .terms_agreed(true)
        .build()
        .expect("test config")
}

pub fn client_for(server: &Arc<MockAcmeServer>) -> (AcmeClient, Arc<ManualClock>) {
    client_with_config(server, test_config())
}

pub fn client_with_config(
    server: &Arc<MockAcmeServer>,
    config: AcmeConfig,
) -> (AcmeClient, Arc<ManualClock>) {
    let http: Arc<dyn HttpClient> = server.clone();
    let clock = Arc::new(ManualClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let resolver = Arc::new(DirectoryResolver::new(
        Arc::clone(&http),
        Arc::clone(&dyn_clock),
        config.directory_ttl,
    ));
    let client = AcmeClient::with_parts(config, http, dyn_clock, resolver).expect("mock client");
    (client, clock)
}
