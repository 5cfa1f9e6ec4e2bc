//! Ledger and Index Clients
//!
//! Read access to algod (the authoritative chain) and to one or more
//! indexers (searchable, possibly lagging), plus transaction submission.
//! Every call is fallible; callers decide whether a failure is retried.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::decoder::{
    decode_application, decode_block, decode_indexer_transactions, AlgodBlockResponse, AlgodBlockTxids,
    ApplicationResponse, ApplicationState, CandidateTransaction, DecodeError, IndexerTransactionsPage,
};
use crate::types::{RoundRange, TransactionQuery};

/// Default algod endpoint (TestNet)
pub const DEFAULT_ALGOD_URL: &str = "https://testnet-api.algonode.cloud";

/// Default indexer endpoints (TestNet), in rank order
pub const DEFAULT_INDEXER_URLS: &[&str] = &[
    "https://testnet-idx.4160.nodely.dev",
    "https://testnet-idx.algonode.cloud",
    "https://algoindexer.testnet.algoexplorerapi.io",
];

/// Per-request timeout in milliseconds
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Page size requested from the indexer
pub const INDEXER_PAGE_LIMIT: u32 = 1000;

const ALGOD_TOKEN_HEADER: &str = "X-Algo-API-Token";
const INDEXER_TOKEN_HEADER: &str = "X-Indexer-API-Token";

/// Errors returned by ledger and index clients
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] DecodeError),

    #[error("No index endpoints configured")]
    NoEndpoints,

    #[error("All {attempted} index endpoints failed, last error: {last}")]
    AllEndpointsFailed { attempted: usize, last: String },

    #[error("Transaction {txid} rejected: {reason}")]
    Rejected { txid: String, reason: String },

    #[error("Transaction {txid} not confirmed within {rounds} rounds")]
    ConfirmationTimeout { txid: String, rounds: u64 },
}

/// Pool status of a submitted transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PendingStatus {
    #[serde(default)]
    pub confirmed_round: Option<u64>,
    #[serde(default)]
    pub pool_error: Option<String>,
}

impl PendingStatus {
    /// Pool error, ignoring the empty string algod reports for "none"
    pub fn rejection(&self) -> Option<&str> {
        self.pool_error.as_deref().filter(|e| !e.is_empty())
    }
}

/// Authoritative chain access
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit signed transaction bytes, returning the transaction id
    async fn submit(&self, signed_txn: &[u8]) -> Result<String, ClientError>;

    /// Latest confirmed round
    async fn chain_head(&self) -> Result<u64, ClientError>;

    /// Transactions matching `query` confirmed within `range`
    async fn recent_transactions(
        &self,
        query: &TransactionQuery,
        range: RoundRange,
    ) -> Result<Vec<CandidateTransaction>, ClientError>;

    async fn pending_status(&self, txid: &str) -> Result<PendingStatus, ClientError>;
}

/// Candidates read from a single index endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedBatch {
    pub transactions: Vec<CandidateTransaction>,
    /// Last round the batch covers; `None` when the endpoint has not
    /// ingested the start of the requested range
    pub covered_to: Option<u64>,
}

/// Searchable, possibly lagging view of historical transactions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Human-readable endpoint name for logs
    fn endpoint(&self) -> String;

    async fn lookup_application(&self, application_id: u64) -> Result<ApplicationState, ClientError>;

    async fn search_transactions(
        &self,
        query: &TransactionQuery,
        range: RoundRange,
    ) -> Result<Vec<CandidateTransaction>, ClientError>;

    /// Latest round the index has ingested
    async fn health_round(&self) -> Result<u64, ClientError>;

    /// Run every query over `range`, clamped to what this endpoint has ingested
    ///
    /// The health check and the searches hit the same endpoint, so
    /// `covered_to` is a round this endpoint has actually indexed.
    async fn search_ingested(
        &self,
        queries: &[TransactionQuery],
        range: RoundRange,
    ) -> Result<IndexedBatch, ClientError> {
        let health = self.health_round().await?;
        let Some(ingested) = RoundRange::new(range.start, range.end.min(health)) else {
            debug!(endpoint = %self.endpoint(), health, wanted = range.start, "Index has not reached range start");
            return Ok(IndexedBatch::default());
        };

        let mut transactions = Vec::new();
        for query in queries {
            transactions.extend(self.search_transactions(query, ingested).await?);
        }
        Ok(IndexedBatch {
            transactions,
            covered_to: Some(ingested.end),
        })
    }
}

fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

async fn read_json<T: DeserializeOwned>(endpoint: &str, response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response.json::<T>().await?)
}

/// True if the transaction satisfies the server-side part of a query
pub fn matches_query(tx: &CandidateTransaction, query: &TransactionQuery) -> bool {
    tx.tx_type == query.tx_type
        && query
            .application_id
            .map_or(true, |app_id| tx.application_id == Some(app_id))
}

// ==================== algod ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct NodeStatus {
    last_round: u64,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "txId")]
    tx_id: String,
}

/// HTTP client for algod
#[derive(Debug, Clone)]
pub struct AlgodClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl AlgodClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into(),
            token,
            http: build_http_client(timeout)?,
        })
    }

    /// Client for the default TestNet endpoint
    pub fn testnet() -> Result<Self, ClientError> {
        Self::new(DEFAULT_ALGOD_URL, None, Duration::from_millis(REQUEST_TIMEOUT_MS))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header(ALGOD_TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = join_url(&self.base_url, path);
        let response = self.request(self.http.get(&url)).send().await?;
        read_json(&url, response).await
    }

    async fn block_transactions(&self, round: u64) -> Result<Vec<CandidateTransaction>, ClientError> {
        let block: AlgodBlockResponse = self.get_json(&format!("/v2/blocks/{round}?format=json")).await?;
        let txids: AlgodBlockTxids = self.get_json(&format!("/v2/blocks/{round}/txids")).await?;
        Ok(decode_block(block.block, txids.block_txids)?)
    }
}

#[async_trait]
impl LedgerClient for AlgodClient {
    async fn submit(&self, signed_txn: &[u8]) -> Result<String, ClientError> {
        let url = join_url(&self.base_url, "/v2/transactions");
        let response = self
            .request(self.http.post(&url))
            .header(CONTENT_TYPE, "application/x-binary")
            .body(signed_txn.to_vec())
            .send()
            .await?;
        let submitted: SubmitResponse = read_json(&url, response).await?;
        Ok(submitted.tx_id)
    }

    async fn chain_head(&self) -> Result<u64, ClientError> {
        let status: NodeStatus = self.get_json("/v2/status").await?;
        Ok(status.last_round)
    }

    async fn recent_transactions(
        &self,
        query: &TransactionQuery,
        range: RoundRange,
    ) -> Result<Vec<CandidateTransaction>, ClientError> {
        let mut matched = Vec::new();
        for round in range.start..=range.end {
            let txs = self.block_transactions(round).await?;
            matched.extend(txs.into_iter().filter(|tx| matches_query(tx, query)));
        }
        debug!(range = %range, count = matched.len(), "Scanned algod blocks");
        Ok(matched)
    }

    async fn pending_status(&self, txid: &str) -> Result<PendingStatus, ClientError> {
        self.get_json(&format!("/v2/transactions/pending/{txid}")).await
    }
}

// ==================== indexer ====================

#[derive(Debug, Deserialize)]
struct IndexerHealth {
    round: u64,
}

/// HTTP client for a single indexer endpoint
#[derive(Debug, Clone)]
pub struct IndexerClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl IndexerClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: base_url.into(),
            token,
            http: build_http_client(timeout)?,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T, ClientError> {
        let url = join_url(&self.base_url, path);
        let mut builder = self.http.get(&url).query(params);
        if let Some(token) = &self.token {
            builder = builder.header(INDEXER_TOKEN_HEADER, token);
        }
        let response = builder.send().await?;
        read_json(&url, response).await
    }
}

#[async_trait]
impl IndexClient for IndexerClient {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn lookup_application(&self, application_id: u64) -> Result<ApplicationState, ClientError> {
        let response: ApplicationResponse = self
            .get_json(&format!("/v2/applications/{application_id}"), &[])
            .await?;
        Ok(decode_application(application_id, response)?)
    }

    async fn search_transactions(
        &self,
        query: &TransactionQuery,
        range: RoundRange,
    ) -> Result<Vec<CandidateTransaction>, ClientError> {
        let mut params = vec![
            ("tx-type", query.tx_type.as_str().to_string()),
            ("min-round", range.start.to_string()),
            ("max-round", range.end.to_string()),
            ("limit", INDEXER_PAGE_LIMIT.to_string()),
        ];
        if let Some(app_id) = query.application_id {
            params.push(("application-id", app_id.to_string()));
        }

        let mut matched = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut page_params = params.clone();
            if let Some(token) = &next {
                page_params.push(("next", token.clone()));
            }

            let page: IndexerTransactionsPage = self.get_json("/v2/transactions", &page_params).await?;
            let page_len = page.transactions.len();
            matched.extend(
                decode_indexer_transactions(page.transactions)
                    .into_iter()
                    .filter(|tx| matches_query(tx, query)),
            );

            match page.next_token {
                Some(token) if page_len > 0 => next = Some(token),
                _ => break,
            }
        }

        debug!(endpoint = %self.base_url, range = %range, count = matched.len(), "Searched indexer");
        Ok(matched)
    }

    async fn health_round(&self) -> Result<u64, ClientError> {
        let health: IndexerHealth = self.get_json("/health", &[]).await?;
        Ok(health.round)
    }
}

// ==================== ranked fallback ====================

/// Ranked list of index endpoints tried in order
///
/// Each call goes to the highest-ranked endpoint first and falls through to
/// the next one on failure.
#[derive(Clone)]
pub struct FallbackIndexClient {
    endpoints: Vec<Arc<dyn IndexClient>>,
}

impl FallbackIndexClient {
    pub fn new(endpoints: Vec<Arc<dyn IndexClient>>) -> Self {
        Self { endpoints }
    }

    /// Build HTTP clients for each URL, keeping their order
    pub fn from_urls(urls: &[String], token: Option<String>, timeout: Duration) -> Result<Self, ClientError> {
        let endpoints = urls
            .iter()
            .map(|url| {
                IndexerClient::new(url.clone(), token.clone(), timeout).map(|c| Arc::new(c) as Arc<dyn IndexClient>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(endpoints))
    }

    pub fn endpoints(&self) -> &[Arc<dyn IndexClient>] {
        &self.endpoints
    }

    async fn first_success<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ClientError>
    where
        F: Fn(Arc<dyn IndexClient>) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut last: Option<ClientError> = None;
        for endpoint in &self.endpoints {
            match call(Arc::clone(endpoint)).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(endpoint = %endpoint.endpoint(), operation, error = %e, "Index endpoint failed");
                    last = Some(e);
                }
            }
        }

        match last {
            Some(e) => Err(ClientError::AllEndpointsFailed {
                attempted: self.endpoints.len(),
                last: e.to_string(),
            }),
            None => Err(ClientError::NoEndpoints),
        }
    }
}

#[async_trait]
impl IndexClient for FallbackIndexClient {
    fn endpoint(&self) -> String {
        let names: Vec<String> = self.endpoints.iter().map(|e| e.endpoint()).collect();
        format!("fallback[{}]", names.join(", "))
    }

    async fn lookup_application(&self, application_id: u64) -> Result<ApplicationState, ClientError> {
        self.first_success("lookup_application", |c| async move {
            c.lookup_application(application_id).await
        })
        .await
    }

    async fn search_transactions(
        &self,
        query: &TransactionQuery,
        range: RoundRange,
    ) -> Result<Vec<CandidateTransaction>, ClientError> {
        self.first_success("search_transactions", |c| async move {
            c.search_transactions(query, range).await
        })
        .await
    }

    async fn health_round(&self) -> Result<u64, ClientError> {
        self.first_success("health_round", |c| async move { c.health_round().await })
            .await
    }

    async fn search_ingested(
        &self,
        queries: &[TransactionQuery],
        range: RoundRange,
    ) -> Result<IndexedBatch, ClientError> {
        self.first_success("search_ingested", |c| async move {
            c.search_ingested(queries, range).await
        })
        .await
    }
}

// ==================== confirmation ====================

/// Wait until a submitted transaction is confirmed
///
/// # Arguments
/// * `ledger` - Ledger to poll
/// * `txid` - Id returned by [`LedgerClient::submit`]
/// * `max_rounds` - Give up once the chain advanced this many rounds
/// * `poll_interval` - Delay between status checks
///
/// # Returns
/// The confirmed round
pub async fn wait_for_confirmation(
    ledger: &dyn LedgerClient,
    txid: &str,
    max_rounds: u64,
    poll_interval: Duration,
) -> Result<u64, ClientError> {
    let start_round = ledger.chain_head().await?;
    loop {
        let status = ledger.pending_status(txid).await?;
        if let Some(round) = status.confirmed_round {
            return Ok(round);
        }
        if let Some(reason) = status.rejection() {
            return Err(ClientError::Rejected {
                txid: txid.to_string(),
                reason: reason.to_string(),
            });
        }

        let head = ledger.chain_head().await?;
        if head.saturating_sub(start_round) > max_rounds {
            return Err(ClientError::ConfirmationTimeout {
                txid: txid.to_string(),
                rounds: max_rounds,
            });
        }
        sleep(poll_interval).await;
    }
}
