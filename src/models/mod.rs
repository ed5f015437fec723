//! Relational write-set shapes produced by the block transformer and consumed by the ledger

/// Forward/backward pointers of the most recently stored block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub previous_block_hash: Option<String>,
    pub next_block_hash: Option<String>,
}

/// Where traversal starts after reading the persisted cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Empty store: resolve the hash at height 0 first
    Genesis,
    /// The last stored block had no successor when written; walk forward again from its parent
    Revisit(String),
    Next(String),
}

impl Cursor {
    pub fn new(previous_block_hash: Option<String>, next_block_hash: Option<String>) -> Self {
        Self {
            previous_block_hash: non_blank(previous_block_hash),
            next_block_hash: non_blank(next_block_hash),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.previous_block_hash.is_none() && self.next_block_hash.is_none()
    }

    pub fn resume_point(&self) -> ResumePoint {
        match (&self.previous_block_hash, &self.next_block_hash) {
            (_, Some(next)) => ResumePoint::Next(next.clone()),
            (Some(previous), None) => ResumePoint::Revisit(previous.clone()),
            (None, None) => ResumePoint::Genesis,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Everything written for one chain position, committed as one unit of work
#[derive(Debug, Clone)]
pub struct BlockWriteSet {
    pub block: BlockRecord,
    /// In the order the block lists them; always empty for genesis
    pub transactions: Vec<TransactionRecord>,
}

impl BlockWriteSet {
    pub fn output_count(&self) -> usize {
        self.transactions.iter().map(|tx| tx.outputs.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub hash: String,
    pub confirmations: i64,
    pub size: i64,
    pub weight: i64,
    pub version: i32,
    pub merkle_root: String,
    pub time: i64,
    pub median_time: i64,
    pub height: i64,
    pub difficulty: f64,
    pub nonce: i64,
    pub ntx: i32,
    pub previous_block_hash: Option<String>,
    pub next_block_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub txid: String,
    pub hash: String,
    pub version: i64,
    pub hex: String,
    pub locktime: i64,
    pub weight: i64,
    pub block_time: Option<i64>,
    pub outputs: Vec<OutputRecord>,
    pub inputs: Vec<InputLink>,
}

#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub value: f64,
    pub vout_position: i32,
    pub script_pub_key_asm: String,
    pub script_pub_key_hex: String,
    pub script_pub_key_req_sigs: i32,
    pub script_pub_key_type: String,
    pub script_pub_key_addresses: Vec<String>,
}

/// How a transaction input refers back to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLink {
    /// Newly minted value; carries the coinbase script as its marker
    Coinbase(String),
    Spend { txid: String, vout_position: i32 },
}

impl InputLink {
    /// Projection onto the nullable `input_*` columns of `transaction_outputs`:
    /// (spent txid, spent position, coinbase marker).
    pub fn columns(&self) -> (Option<&str>, Option<i32>, Option<&str>) {
        match self {
            InputLink::Coinbase(marker) => (None, None, Some(marker.as_str())),
            InputLink::Spend { txid, vout_position } => {
                (Some(txid.as_str()), Some(*vout_position), None)
            }
        }
    }
}

impl std::fmt::Display for InputLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputLink::Coinbase(_) => write!(f, "coinbase"),
            InputLink::Spend { txid, vout_position } => write!(f, "{}:{}", txid, vout_position),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cursor_resumes_at_genesis() {
        let cursor = Cursor::new(Some("  ".to_string()), None);
        assert!(cursor.is_empty());
        assert_eq!(cursor.resume_point(), ResumePoint::Genesis);
    }

    #[test]
    fn test_known_successor_wins() {
        let cursor = Cursor::new(Some("aa".to_string()), Some("bb".to_string()));
        assert_eq!(cursor.resume_point(), ResumePoint::Next("bb".to_string()));

        let genesis_only = Cursor::new(None, Some("bb".to_string()));
        assert_eq!(genesis_only.resume_point(), ResumePoint::Next("bb".to_string()));
    }

    #[test]
    fn test_missing_successor_revisits_parent() {
        let cursor = Cursor::new(Some("aa".to_string()), Some(String::new()));
        assert_eq!(cursor.resume_point(), ResumePoint::Revisit("aa".to_string()));
    }

    #[test]
    fn test_input_link_columns() {
        let spend = InputLink::Spend {
            txid: "ab".to_string(),
            vout_position: 3,
        };
        assert_eq!(spend.columns(), (Some("ab"), Some(3), None));
        assert_eq!(spend.to_string(), "ab:3");

        let coinbase = InputLink::Coinbase("04ffff001d".to_string());
        assert_eq!(coinbase.columns(), (None, None, Some("04ffff001d")));
    }
}
