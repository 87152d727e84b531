//! JSON-RPC client for the chain the LIKE token lives on.
//!
//! Charges are created by the user's wallet, so `create_charge` only records intent.
//! Confirmation reads the receipt, requires the configured number of confirmations and
//! decodes `Curation` logs emitted by the curation contract.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::str::FromStr;
use std::time::Duration;

use super::{
    ChainReceipt, ChargeReceipt, ChargeRequest, ConfirmLookup, Confirmation, CurationLog,
    PaymentProvider, ProviderError, ProviderOutcome, RefundRequest, Retryable,
};
use crate::domain::ProviderKind;

const CURATION_EVENT: &str = "Curation(address,address,address,string,uint256)";

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: String,
    from: String,
    to: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Debug, Clone)]
pub struct BlockchainSettings {
    pub rpc_url: String,
    pub api_key: Option<String>,
    pub chain_id: i64,
    pub confirmations: u64,
    pub curation_contract: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct BlockchainClient {
    client: Client,
    settings: BlockchainSettings,
    curation_topic: String,
    circuit_breaker: Breaker,
}

impl BlockchainClient {
    pub fn new(settings: BlockchainSettings) -> Self {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(30), Duration::from_secs(60));
        let policy = failure_policy::consecutive_failures(5, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        Self {
            client,
            curation_topic: format!("0x{}", hex::encode(Keccak256::digest(CURATION_EVENT.as_bytes()))),
            settings,
            circuit_breaker,
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, ProviderError> {
        let mut request = self.client.post(&self.settings.rpc_url).json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }));
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let call = async move {
            let response = request.send().await?;
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(ProviderError::RateLimited);
            }
            if status.is_server_error() {
                return Err(ProviderError::Unavailable(status.to_string()));
            }
            if !status.is_success() {
                return Err(ProviderError::Misconfigured(format!("rpc returned {}", status)));
            }

            let body: RpcResponse<T> = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            if let Some(error) = body.error {
                return Err(ProviderError::InvalidResponse(format!(
                    "rpc error {}: {}",
                    error.code, error.message
                )));
            }
            Ok(body.result)
        };

        match self.circuit_breaker.call_with(is_transient, call).await {
            Ok(value) => Ok(value),
            Err(FailsafeError::Rejected) => Err(ProviderError::Unavailable(
                "rpc circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    pub async fn block_number(&self) -> Result<u64, ProviderError> {
        let head: Option<String> = self.call("eth_blockNumber", json!([])).await?;
        let head = head.ok_or_else(|| ProviderError::InvalidResponse("empty block number".into()))?;
        parse_quantity(&head)
    }

    fn decode_curations(&self, logs: &[RpcLog]) -> Result<Vec<CurationLog>, ProviderError> {
        let contract = self
            .settings
            .curation_contract
            .as_ref()
            .map(|c| c.to_ascii_lowercase());

        logs.iter()
            .filter(|log| log.topics.first().map(|t| t.to_ascii_lowercase()) == Some(self.curation_topic.clone()))
            .filter(|log| {
                contract
                    .as_ref()
                    .map_or(true, |c| log.address.to_ascii_lowercase() == *c)
            })
            .map(decode_curation)
            .collect()
    }
}

fn is_transient(error: &ProviderError) -> bool {
    error.is_retryable()
}

fn parse_quantity(value: &str) -> Result<u64, ProviderError> {
    let digits = value.trim_start_matches("0x");
    u64::from_str_radix(if digits.is_empty() { "0" } else { digits }, 16)
        .map_err(|_| ProviderError::InvalidResponse(format!("bad quantity {}", value)))
}

fn topic_address(topic: &str) -> Result<String, ProviderError> {
    let hex_part = topic.trim_start_matches("0x");
    if hex_part.len() != 64 {
        return Err(ProviderError::InvalidResponse(format!("bad topic {}", topic)));
    }
    Ok(format!("0x{}", hex_part[24..].to_ascii_lowercase()))
}

fn word_to_decimal(word: &[u8]) -> Result<BigDecimal, ProviderError> {
    let significant: Vec<u8> = word.iter().copied().skip_while(|b| *b == 0).collect();
    if significant.len() > 16 {
        return Err(ProviderError::InvalidResponse("uint256 exceeds u128".into()));
    }
    let mut value: u128 = 0;
    for byte in significant {
        value = (value << 8) | u128::from(byte);
    }
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

fn word_to_usize(word: &[u8]) -> Result<usize, ProviderError> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(ProviderError::InvalidResponse("abi offset too large".into()));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[24..32]);
    usize::try_from(u64::from_be_bytes(bytes))
        .map_err(|_| ProviderError::InvalidResponse("abi offset too large".into()))
}

fn abi_word(data: &[u8], index: usize) -> Result<&[u8], ProviderError> {
    data.get(index * 32..(index + 1) * 32)
        .ok_or_else(|| ProviderError::InvalidResponse("truncated curation data".into()))
}

/// `Curation(address indexed curator, address indexed creator, address indexed token,
/// string uri, uint256 amount)`.
fn decode_curation(log: &RpcLog) -> Result<CurationLog, ProviderError> {
    if log.topics.len() < 4 {
        return Err(ProviderError::InvalidResponse("curation log without topics".into()));
    }
    let data = hex::decode(log.data.trim_start_matches("0x"))
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
    let uri_offset = word_to_usize(abi_word(&data, 0)?)?;
    let amount = word_to_decimal(abi_word(&data, 1)?)?;

    let length_word = data
        .get(uri_offset..uri_offset + 32)
        .ok_or_else(|| ProviderError::InvalidResponse("truncated uri".into()))?;
    let uri_len = word_to_usize(length_word)?;
    let uri_bytes = data
        .get(uri_offset + 32..uri_offset + 32 + uri_len)
        .ok_or_else(|| ProviderError::InvalidResponse("truncated uri".into()))?;

    let token = topic_address(&log.topics[3])?;

    Ok(CurationLog {
        curator: topic_address(&log.topics[1])?,
        creator: topic_address(&log.topics[2])?,
        token: Some(token).filter(|t| t != "0x0000000000000000000000000000000000000000"),
        uri: String::from_utf8_lossy(uri_bytes).into_owned(),
        amount,
    })
}

/// LIKE amount to raw token units.
pub fn to_token_units(amount: &BigDecimal, decimals: u32) -> BigDecimal {
    let scale = BigDecimal::from_str(&format!("1{}", "0".repeat(decimals as usize)))
        .unwrap_or_else(|_| BigDecimal::from(1));
    (amount * scale).round(0)
}

#[async_trait]
impl PaymentProvider for BlockchainClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Blockchain
    }

    async fn create_charge(&self, _request: &ChargeRequest) -> Result<ChargeReceipt, ProviderError> {
        Ok(ChargeReceipt {
            provider_ref: None,
            outcome: ProviderOutcome::Pending,
            client_secret: None,
        })
    }

    async fn confirm(&self, lookup: &ConfirmLookup) -> Result<Confirmation, ProviderError> {
        let hash = lookup.provider_ref.as_deref().ok_or_else(|| {
            ProviderError::NotFound(format!("no tx hash recorded for {}", lookup.correlation_id))
        })?;

        let receipt: Option<RpcReceipt> = self
            .call("eth_getTransactionReceipt", json!([hash]))
            .await?;
        let Some(receipt) = receipt else {
            return Ok(Confirmation {
                provider_ref: Some(hash.to_string()),
                outcome: ProviderOutcome::Pending,
                chain: None,
            });
        };

        if receipt.status.as_deref() == Some("0x0") {
            return Ok(Confirmation {
                provider_ref: Some(receipt.transaction_hash),
                outcome: ProviderOutcome::Failed,
                chain: None,
            });
        }

        let block_number = parse_quantity(&receipt.block_number)?;
        let head = self.block_number().await?;
        let have = head.saturating_sub(block_number) + 1;
        if have < self.settings.confirmations {
            return Err(ProviderError::InsufficientConfirmations {
                have,
                need: self.settings.confirmations,
            });
        }

        let curations = self.decode_curations(&receipt.logs)?;
        let tx_hash = receipt.transaction_hash.to_ascii_lowercase();

        Ok(Confirmation {
            provider_ref: Some(tx_hash.clone()),
            outcome: ProviderOutcome::Succeeded,
            chain: Some(ChainReceipt {
                chain_id: self.settings.chain_id,
                tx_hash,
                from: receipt.from.to_ascii_lowercase(),
                to: receipt.to.map(|t| t.to_ascii_lowercase()),
                block_number: i64::try_from(block_number)
                    .map_err(|_| ProviderError::InvalidResponse("block number overflow".into()))?,
                curations,
            }),
        })
    }

    async fn refund(&self, _request: &RefundRequest) -> Result<ChargeReceipt, ProviderError> {
        Err(ProviderError::Declined(
            "on-chain transfers cannot be refunded".to_string(),
        ))
    }
}
