use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

coded_enum! {
    pub enum LedgerAction: "ledger action" {
        First => "FST",
        Sale => "SAL",
        Creation => "CRE",
        Refill => "REF",
        Transfer => "TRF",
        Subscribe => "SUB",
        Badge => "BDG",
        Fusion => "FUS",
        Refund => "RFD",
        Void => "VID",
    }
}

/// Transaction as returned by the federated ledger once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub uuid: Uuid,
    pub hash: String,
    pub datetime: DateTime<Utc>,
    #[serde(default)]
    pub subscription_start_datetime: Option<DateTime<Utc>>,
    pub sender: Uuid,
    pub receiver: Uuid,
    pub asset: Uuid,
    pub amount: i64,
    pub action: LedgerAction,
    pub previous_transaction: Uuid,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub verify_hash: bool,
}

impl TransactionReceipt {
    /// Checks the shape the ledger guarantees for an accepted transaction.
    pub fn validate(&self) -> Result<(), String> {
        if self.hash.len() != 64 || !self.hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid transaction hash '{}'", self.hash));
        }
        if self.amount < 0 {
            return Err(format!("negative transaction amount {}", self.amount));
        }
        if !self.verify_hash {
            return Err("ledger could not verify the transaction hash".to_string());
        }
        Ok(())
    }
}
