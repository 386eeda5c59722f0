//! JSON-RPC reads against a ledger node.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use super::{HolderBalance, HolderPage, HolderSource};
use crate::model::{AssetId, BASE_UNIT};

const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const TOKEN_ACCOUNT_SIZE: u64 = 165;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Minimal JSON-RPC 2.0 client.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build RPC HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> anyhow::Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": format!("evolver-{}", uuid::Uuid::new_v4()),
            "method": method,
            "params": params,
        });
        let resp: RpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", method))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", method))?
            .json()
            .await
            .with_context(|| format!("{} returned an unreadable body", method))?;

        if let Some(err) = resp.error {
            bail!("{} failed ({}): {}", method, err.code, err.message);
        }
        resp.result
            .with_context(|| format!("{} returned no result", method))
    }

    /// Whether `owner` already holds a token account for `mint`.
    pub async fn token_account_exists(&self, owner: &str, mint: &AssetId) -> anyhow::Result<bool> {
        let result: Value = self
            .call(
                "getTokenAccountsByOwner",
                json!([owner, { "mint": mint.as_str() }, { "encoding": "jsonParsed" }]),
            )
            .await?;
        Ok(result["value"]
            .as_array()
            .is_some_and(|accounts| !accounts.is_empty()))
    }
}

/// Indexed holder enumeration (DAS `getTokenAccounts`), paginated.
pub struct DasHolderSource {
    rpc: RpcClient,
}

impl DasHolderSource {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl HolderSource for DasHolderSource {
    fn name(&self) -> &str {
        "das"
    }

    async fn fetch_page(
        &self,
        asset: &AssetId,
        page: u32,
        limit: u32,
    ) -> anyhow::Result<HolderPage> {
        let result: Value = self
            .rpc
            .call(
                "getTokenAccounts",
                json!({ "mint": asset.as_str(), "page": page, "limit": limit }),
            )
            .await?;
        let parsed = parse_das_page(&result, limit);
        debug!(asset = %asset.short(), page, count = parsed.holders.len(), "DAS page");
        Ok(parsed)
    }
}

/// Direct scan of every token account for the mint. Returns everything on
/// page 1.
pub struct ScanHolderSource {
    rpc: RpcClient,
}

impl ScanHolderSource {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl HolderSource for ScanHolderSource {
    fn name(&self) -> &str {
        "program-scan"
    }

    async fn fetch_page(
        &self,
        asset: &AssetId,
        page: u32,
        _limit: u32,
    ) -> anyhow::Result<HolderPage> {
        if page > 1 {
            return Ok(HolderPage::default());
        }
        let result: Value = self
            .rpc
            .call(
                "getProgramAccounts",
                json!([
                    TOKEN_PROGRAM_ID,
                    {
                        "encoding": "jsonParsed",
                        "filters": [
                            { "dataSize": TOKEN_ACCOUNT_SIZE },
                            { "memcmp": { "offset": 0, "bytes": asset.as_str() } }
                        ]
                    }
                ]),
            )
            .await?;
        parse_program_accounts(&result)
    }
}

/// `amount` is in base units; a page shorter than `limit` is the last one.
fn parse_das_page(result: &Value, limit: u32) -> HolderPage {
    let accounts = result["token_accounts"].as_array();
    let count = accounts.map_or(0, Vec::len);
    let holders = accounts
        .into_iter()
        .flatten()
        .filter_map(|acc| {
            let owner = acc["owner"].as_str().filter(|o| !o.is_empty())?;
            let raw = acc["amount"].as_f64()?;
            Some(HolderBalance {
                owner: owner.to_string(),
                amount: raw / BASE_UNIT,
            })
        })
        .collect();
    HolderPage {
        holders,
        has_more: count > 0 && count >= limit as usize,
    }
}

fn parse_program_accounts(result: &Value) -> anyhow::Result<HolderPage> {
    let accounts = result
        .as_array()
        .context("getProgramAccounts result is not an array")?;
    let holders = accounts
        .iter()
        .filter_map(|acc| {
            let info = &acc["account"]["data"]["parsed"]["info"];
            let owner = info["owner"].as_str()?;
            let amount = info["tokenAmount"]["uiAmount"].as_f64().or_else(|| {
                info["tokenAmount"]["amount"]
                    .as_str()
                    .and_then(|a| a.parse::<f64>().ok())
                    .map(|raw| raw / BASE_UNIT)
            })?;
            Some(HolderBalance {
                owner: owner.to_string(),
                amount,
            })
        })
        .collect();
    Ok(HolderPage {
        holders,
        has_more: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn das_page_scales_amounts_and_detects_more() {
        let result = json!({
            "total": 2,
            "token_accounts": [
                { "owner": "w1", "amount": 2_500_000 },
                { "owner": "w2", "amount": 0 }
            ]
        });
        let page = parse_das_page(&result, 2);
        assert_eq!(page.holders.len(), 2);
        assert_eq!(page.holders[0].amount, 2.5);
        assert!(page.has_more);

        let page = parse_das_page(&result, 1000);
        assert!(!page.has_more);
    }

    #[test]
    fn das_page_skips_accounts_without_owner() {
        let result = json!({ "token_accounts": [ { "owner": "", "amount": 5 }, { "amount": 5 } ] });
        let page = parse_das_page(&result, 1000);
        assert!(page.holders.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn empty_das_result_is_last_page() {
        let page = parse_das_page(&json!({}), 1000);
        assert!(page.holders.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn program_accounts_read_parsed_token_amount() {
        let result = json!([
            { "pubkey": "a1", "account": { "data": { "parsed": { "info": {
                "owner": "w1", "tokenAmount": { "amount": "1000000", "decimals": 6, "uiAmount": 1.0 }
            }}}}},
            { "pubkey": "a2", "account": { "data": { "parsed": { "info": {
                "owner": "w2", "tokenAmount": { "amount": "3000000", "decimals": 6 }
            }}}}}
        ]);
        let page = parse_program_accounts(&result).unwrap();
        assert_eq!(page.holders[0].amount, 1.0);
        assert_eq!(page.holders[1].amount, 3.0);
        assert!(!page.has_more);
    }

    #[test]
    fn program_accounts_reject_non_array() {
        assert!(parse_program_accounts(&json!({"oops": 1})).is_err());
    }
}
