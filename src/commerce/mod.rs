//! Commerce documents
//!
//! Quote / Invoice / Receipt records exchanged around a job settlement.
//! Each document carries a deterministic SHA-256 content hash over its
//! sorted-key JSON form, excluding the hash and signature fields, so two
//! parties can verify they are looking at the same document without a
//! signing ceremony.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::{AgentId, Credits, JobId};
use crate::types::{GuildError, Result};

/// How long a quote stays valid
const QUOTE_EXPIRY: i64 = 5 * 60;

/// Invoice payment window
const INVOICE_DUE: i64 = 60 * 60;

/// An agent's priced offer for a job, attached to its bid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub message_type: String,
    pub message_id: String,
    pub job_id: JobId,
    pub buyer_agent_id: AgentId,
    pub seller_agent_id: AgentId,
    pub price: Credits,
    pub currency: String,
    pub skills: Vec<String>,
    pub estimated_duration_ms: u64,
    pub expiry: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub canonical_hash: String,
}

/// Line item on an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub amount: Credits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
}

/// Payment request issued at settlement time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub message_type: String,
    pub message_id: String,
    pub job_id: JobId,
    pub buyer_agent_id: AgentId,
    pub seller_agent_id: AgentId,
    pub price: Credits,
    pub currency: String,
    pub due_date: DateTime<Utc>,
    pub line_items: Vec<LineItem>,
    pub status: InvoiceStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub canonical_hash: String,
}

/// Proof of payment, referencing the invoice and the ledger transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub message_type: String,
    pub message_id: String,
    pub job_id: JobId,
    pub buyer_agent_id: AgentId,
    pub seller_agent_id: AgentId,
    pub price: Credits,
    pub currency: String,
    pub invoice_id: String,
    pub payment_tx_ref: String,
    pub ledger_sequence: u64,
    pub payment_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub canonical_hash: String,
}

/// Canonical SHA-256 hash of a document's JSON form.
///
/// Keys are serialized in sorted order; `canonical_hash` and `signature`
/// are removed before hashing so the hash is stable across signing.
pub fn canonical_hash<T: Serialize>(doc: &T) -> String {
    let mut value = serde_json::to_value(doc).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("canonical_hash");
        map.remove("signature");
    }
    // serde_json maps are BTreeMap-backed: serialization is key-sorted
    let canonical = serde_json::to_string(&value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn message_id(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..12])
}

/// Parameters for building a quote
pub struct QuoteParams {
    pub job_id: JobId,
    pub buyer_agent_id: AgentId,
    pub seller_agent_id: AgentId,
    pub price: Credits,
    pub currency: String,
    pub skills: Vec<String>,
    pub estimated_duration_ms: u64,
}

pub fn build_quote(params: QuoteParams) -> Quote {
    let now = Utc::now();
    let mut quote = Quote {
        message_type: "Quote".to_string(),
        message_id: message_id("quote"),
        job_id: params.job_id,
        buyer_agent_id: params.buyer_agent_id,
        seller_agent_id: params.seller_agent_id,
        price: params.price,
        currency: params.currency,
        skills: params.skills,
        estimated_duration_ms: params.estimated_duration_ms,
        expiry: now + Duration::seconds(QUOTE_EXPIRY),
        timestamp: now,
        signature: "placeholder".to_string(),
        canonical_hash: String::new(),
    };
    quote.canonical_hash = canonical_hash(&quote);
    quote
}

/// Parameters for building an invoice
pub struct InvoiceParams {
    pub job_id: JobId,
    pub buyer_agent_id: AgentId,
    pub seller_agent_id: AgentId,
    pub price: Credits,
    pub currency: String,
    pub description: String,
}

pub fn build_invoice(params: InvoiceParams) -> Invoice {
    let now = Utc::now();
    let mut invoice = Invoice {
        message_type: "Invoice".to_string(),
        message_id: message_id("inv"),
        job_id: params.job_id,
        buyer_agent_id: params.buyer_agent_id,
        seller_agent_id: params.seller_agent_id,
        price: params.price,
        currency: params.currency,
        due_date: now + Duration::seconds(INVOICE_DUE),
        line_items: vec![LineItem {
            description: params.description,
            amount: params.price,
        }],
        status: InvoiceStatus::Pending,
        timestamp: now,
        signature: "placeholder".to_string(),
        canonical_hash: String::new(),
    };
    invoice.canonical_hash = canonical_hash(&invoice);
    invoice
}

/// Parameters for building a receipt
pub struct ReceiptParams {
    pub job_id: JobId,
    pub buyer_agent_id: AgentId,
    pub seller_agent_id: AgentId,
    pub price: Credits,
    pub currency: String,
    pub invoice_id: String,
    pub payment_tx_ref: String,
    pub ledger_sequence: u64,
}

pub fn build_receipt(params: ReceiptParams) -> Receipt {
    let now = Utc::now();
    let mut receipt = Receipt {
        message_type: "Receipt".to_string(),
        message_id: message_id("rcpt"),
        job_id: params.job_id,
        buyer_agent_id: params.buyer_agent_id,
        seller_agent_id: params.seller_agent_id,
        price: params.price,
        currency: params.currency,
        invoice_id: params.invoice_id,
        payment_tx_ref: params.payment_tx_ref,
        ledger_sequence: params.ledger_sequence,
        payment_timestamp: now,
        timestamp: now,
        signature: "placeholder".to_string(),
        canonical_hash: String::new(),
    };
    receipt.canonical_hash = canonical_hash(&receipt);
    receipt
}

/// Validate an inbound quote against the required-field schema.
///
/// Typed deserialization already enforces shape; this rejects documents
/// with the wrong message type or blank required fields.
pub fn validate_quote(quote: &Quote) -> Result<()> {
    let mut missing = Vec::new();
    if quote.message_type != "Quote" {
        missing.push("message_type");
    }
    if quote.message_id.is_empty() {
        missing.push("message_id");
    }
    if quote.job_id.as_str().is_empty() {
        missing.push("job_id");
    }
    if quote.buyer_agent_id.as_str().is_empty() {
        missing.push("buyer_agent_id");
    }
    if quote.seller_agent_id.as_str().is_empty() {
        missing.push("seller_agent_id");
    }
    if quote.currency.is_empty() {
        missing.push("currency");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GuildError::InvalidDocument {
            kind: "Quote",
            missing,
        })
    }
}
