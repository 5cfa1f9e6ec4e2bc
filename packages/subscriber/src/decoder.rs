//! Transaction Decoder
//!
//! Decodes transactions returned by algod (block JSON) and the indexer
//! (search JSON) into a single [`CandidateTransaction`] shape, and decodes
//! application global state lookups.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use sha2::{Digest, Sha512_256};
use thiserror::Error;
use tracing::warn;

use crate::types::TransactionType;

/// Length of an account public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of the checksum appended to a public key in an address
const ADDRESS_CHECKSUM_LEN: usize = 4;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Errors that can occur during decoding
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to decode base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Public key must be {PUBLIC_KEY_LEN} bytes, got {0}")]
    InvalidPublicKey(usize),

    #[error("Block has {txns} transactions but {txids} transaction ids")]
    TxidMismatch { txns: usize, txids: usize },

    #[error("Application {0} not found")]
    ApplicationNotFound(u64),

    #[error("Application {0} has no global state")]
    MissingGlobalState(u64),
}

/// A transaction observed from the ledger or the indexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTransaction {
    /// Transaction id, globally unique on the ledger
    pub id: String,
    /// Sender address
    pub sender: String,
    /// Round the transaction was confirmed in, `None` while pending
    pub confirmed_round: Option<u64>,
    /// Position within the confirmed round
    pub intra_round_offset: Option<u64>,
    pub tx_type: TransactionType,
    /// Called application, if this is an application call
    pub application_id: Option<u64>,
    /// Raw application-call arguments in order
    pub application_args: Vec<Vec<u8>>,
}

impl CandidateTransaction {
    pub fn is_pending(&self) -> bool {
        self.confirmed_round.is_none()
    }

    /// First application argument, which carries the method selector
    pub fn first_arg(&self) -> Option<&[u8]> {
        self.application_args.first().map(Vec::as_slice)
    }

    /// First argument as lowercase hex without prefix
    pub fn first_arg_hex(&self) -> Option<String> {
        self.first_arg().map(hex::encode)
    }
}

// ==================== Indexer wire format ====================

/// One page of `GET /v2/transactions`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerTransactionsPage {
    #[serde(default)]
    pub current_round: Option<u64>,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub transactions: Vec<IndexerTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerTransaction {
    pub id: String,
    pub sender: String,
    pub tx_type: String,
    #[serde(default)]
    pub confirmed_round: Option<u64>,
    #[serde(default)]
    pub intra_round_offset: Option<u64>,
    #[serde(default)]
    pub application_transaction: Option<IndexerApplicationTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerApplicationTransaction {
    #[serde(default)]
    pub application_id: u64,
    #[serde(default)]
    pub application_args: Vec<String>,
}

/// Decode an indexer transaction
pub fn decode_indexer_transaction(tx: IndexerTransaction) -> Result<CandidateTransaction, DecodeError> {
    let (application_id, application_args) = match tx.application_transaction {
        Some(app) => (Some(app.application_id), decode_args(&app.application_args)?),
        None => (None, Vec::new()),
    };

    Ok(CandidateTransaction {
        id: tx.id,
        sender: tx.sender,
        confirmed_round: tx.confirmed_round,
        intra_round_offset: tx.intra_round_offset,
        tx_type: TransactionType::from(tx.tx_type.as_str()),
        application_id,
        application_args,
    })
}

/// Decode a page of indexer transactions, skipping any that fail to decode
///
/// A malformed row never hides its well-formed neighbours.
pub fn decode_indexer_transactions(txs: Vec<IndexerTransaction>) -> Vec<CandidateTransaction> {
    txs.into_iter()
        .filter_map(|raw| {
            let txid = raw.id.clone();
            match decode_indexer_transaction(raw) {
                Ok(tx) => Some(tx),
                Err(e) => {
                    warn!(txid = %txid, error = %e, "Skipping undecodable indexer transaction");
                    None
                }
            }
        })
        .collect()
}

// ==================== Algod wire format ====================

/// `GET /v2/blocks/{round}?format=json`
#[derive(Debug, Clone, Deserialize)]
pub struct AlgodBlockResponse {
    pub block: AlgodBlock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlgodBlock {
    #[serde(default)]
    pub rnd: u64,
    #[serde(default)]
    pub txns: Vec<AlgodSignedTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlgodSignedTransaction {
    pub txn: AlgodTransaction,
}

/// Transaction fields as msgpack keys; byte fields are base64
#[derive(Debug, Clone, Deserialize)]
pub struct AlgodTransaction {
    #[serde(rename = "type")]
    pub tx_type: String,
    pub snd: String,
    #[serde(default)]
    pub apid: Option<u64>,
    #[serde(default)]
    pub apaa: Vec<String>,
}

/// `GET /v2/blocks/{round}/txids`
#[derive(Debug, Clone, Deserialize)]
pub struct AlgodBlockTxids {
    #[serde(rename = "blockTxids")]
    pub block_txids: Vec<String>,
}

/// Decode the top-level transactions of a block, pairing them with their ids
///
/// A transaction that fails to decode is logged and skipped; the others keep
/// their position in the block as their intra-round offset.
///
/// # Arguments
/// * `block` - The block as returned by algod
/// * `txids` - Transaction ids in block order
pub fn decode_block(block: AlgodBlock, txids: Vec<String>) -> Result<Vec<CandidateTransaction>, DecodeError> {
    if block.txns.len() != txids.len() {
        return Err(DecodeError::TxidMismatch {
            txns: block.txns.len(),
            txids: txids.len(),
        });
    }

    let round = block.rnd;
    let decoded = block
        .txns
        .into_iter()
        .zip(txids)
        .enumerate()
        .filter_map(|(offset, (signed, id))| match decode_block_transaction(signed.txn) {
            Ok((sender, tx_type, application_id, application_args)) => Some(CandidateTransaction {
                id,
                sender,
                confirmed_round: Some(round),
                intra_round_offset: Some(offset as u64),
                tx_type,
                application_id,
                application_args,
            }),
            Err(e) => {
                warn!(round, txid = %id, error = %e, "Skipping undecodable block transaction");
                None
            }
        })
        .collect();
    Ok(decoded)
}

type BlockFields = (String, TransactionType, Option<u64>, Vec<Vec<u8>>);

fn decode_block_transaction(txn: AlgodTransaction) -> Result<BlockFields, DecodeError> {
    let tx_type = TransactionType::from(txn.tx_type.as_str());
    let application_id = match tx_type {
        // app creation omits apid
        TransactionType::ApplicationCall => Some(txn.apid.unwrap_or_default()),
        _ => None,
    };
    let sender = encode_address(&STANDARD.decode(&txn.snd)?)?;
    Ok((sender, tx_type, application_id, decode_args(&txn.apaa)?))
}

/// Encode a public key as an Algorand address
///
/// The address is the unpadded base32 form of the key followed by the last
/// four bytes of its SHA-512/256 digest.
pub fn encode_address(public_key: &[u8]) -> Result<String, DecodeError> {
    if public_key.len() != PUBLIC_KEY_LEN {
        return Err(DecodeError::InvalidPublicKey(public_key.len()));
    }

    let digest = Sha512_256::digest(public_key);
    let mut raw = Vec::with_capacity(PUBLIC_KEY_LEN + ADDRESS_CHECKSUM_LEN);
    raw.extend_from_slice(public_key);
    raw.extend_from_slice(&digest[digest.len() - ADDRESS_CHECKSUM_LEN..]);
    Ok(base32_unpadded(&raw))
}

fn base32_unpadded(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0u8;
    for &byte in data {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn decode_args(args: &[String]) -> Result<Vec<Vec<u8>>, DecodeError> {
    args.iter().map(|arg| STANDARD.decode(arg).map_err(DecodeError::from)).collect()
}

// ==================== Application state ====================

/// `GET /v2/applications/{id}` on the indexer
#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationResponse {
    #[serde(default)]
    pub application: Option<IndexerApplication>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerApplication {
    pub id: u64,
    pub params: IndexerApplicationParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerApplicationParams {
    #[serde(default)]
    pub global_state: Option<Vec<GlobalStateEntry>>,
}

/// One key/value pair of application global state; key is base64
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GlobalStateEntry {
    pub key: String,
    pub value: TealValue,
}

/// TEAL value: `type` 1 is bytes (base64), 2 is uint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TealValue {
    #[serde(rename = "type")]
    pub value_type: u8,
    #[serde(default)]
    pub bytes: String,
    #[serde(default)]
    pub uint: u64,
}

/// Current global state of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationState {
    pub application_id: u64,
    pub global_state: Vec<GlobalStateEntry>,
}

impl ApplicationState {
    /// Find the entry whose base64 key equals `key_b64`
    pub fn entry(&self, key_b64: &str) -> Option<&GlobalStateEntry> {
        self.global_state.iter().find(|entry| entry.key == key_b64)
    }
}

/// Decode an application lookup, requiring global state to be present
pub fn decode_application(
    application_id: u64,
    response: ApplicationResponse,
) -> Result<ApplicationState, DecodeError> {
    let application = response
        .application
        .ok_or(DecodeError::ApplicationNotFound(application_id))?;
    let global_state = application
        .params
        .global_state
        .ok_or(DecodeError::MissingGlobalState(application.id))?;

    Ok(ApplicationState {
        application_id: application.id,
        global_state,
    })
}
