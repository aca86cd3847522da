//! # acme-core
//!
//! ACME（RFC 8555）客戶端核心，用於向 Let's Encrypt 等 CA 自動申請證書。
//!
//! - **帳戶**：[`account`] 負責註冊、更新、停用、金鑰輪替與撤銷證書，
//!   [`storage`] 將帳戶記錄（含私鑰）持久化。
//! - **請求層**：[`client::AcmeClient`] 統一處理目錄快取（[`directory`]）、
//!   nonce（[`nonce`]）、JWS 簽名（[`jws`]）以及暫時性錯誤的重試。
//! - **訂單**：[`order::OrderOrchestrator`] 從建立訂單、完成挑戰、finalize 到下載證書鏈，
//!   挑戰透過 [`solver`] 的 HTTP-01、DNS-01（[`cloudflare`]）與 TLS-ALPN-01 解決器發佈。
//!
//! ## 示例
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use acme_core::{
//!     account::AccountClient,
//!     client::AcmeClient,
//!     config::{AcmeConfig, LETS_ENCRYPT_STAGING},
//!     order::OrderOrchestrator,
//!     solver::{ChallengeSolver, WebrootProvisioner},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AcmeConfig::builder()
//!         .directory_url(LETS_ENCRYPT_STAGING)
//!         .terms_agreed(true)
//!         .build()?;
//!     let client = AcmeClient::new(config)?;
//!
//!     let account = AccountClient::new(&client).register("admin@example.com", true)?;
//!
//!     let solver = ChallengeSolver::Http01(Arc::new(WebrootProvisioner::new("/var/www/html")));
//!     let issued = OrderOrchestrator::new(&client, &account, vec![solver])
//!         .issue(&["example.com", "www.example.com"])?;
//!
//!     std::fs::write("fullchain.pem", issued.chain.to_pem()?)?;
//!     std::fs::write("privkey.pem", issued.key.to_pem()?)?;
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod base64;
pub mod certificate;
pub mod challenge;
pub mod client;
pub mod clock;
pub mod cloudflare;
pub mod config;
pub mod csr;
pub mod directory;
pub mod http;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod nonce;
pub mod order;
pub mod payload;
pub mod problem;
pub mod protection;
pub mod signature;
pub mod solver;
pub mod storage;

#[cfg(test)]
mod testing;
