//! Ledger repository: cursor lookup, per-block persistence and full reset

use duckdb::{params, Connection};

use super::{Database, OptionalExt, CLEAR_LEDGER};
use crate::error::{IndexError, IndexResult};
use crate::models::{BlockRecord, BlockWriteSet, Cursor, InputLink, OutputRecord, TransactionRecord};
use crate::sync::Shutdown;

/// Owns every read and write the engine makes against the relational store
#[derive(Clone)]
pub struct LedgerRepository {
    db: Database,
}

/// What one committed block wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub block_id: i64,
    pub transactions: usize,
    pub outputs: usize,
    pub linked_inputs: usize,
    pub coinbase_inputs: usize,
    /// Spends whose referenced output was not in the store
    pub unlinked_inputs: Vec<String>,
}

impl LedgerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Irreversibly empties blocks, transactions and outputs in one unit of
    /// work. Ids restart at 1 since the writer derives them from the stored rows.
    pub fn reset(&self) -> IndexResult<()> {
        self.db.execute_transaction(|conn| {
            conn.execute_batch(CLEAR_LEDGER)?;
            Ok::<_, IndexError>(())
        })?;
        tracing::warn!("Ledger reset: blocks, transactions and outputs truncated");
        Ok(())
    }

    /// Pointers of the most recently inserted block, or an empty cursor
    pub fn cursor(&self) -> IndexResult<Cursor> {
        let row = self.db.query_one(
            "SELECT previous_block_hash, next_block_hash FROM blocks ORDER BY id DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
        )?;

        Ok(match row {
            Some((previous, next)) => Cursor::new(previous, next),
            None => Cursor::default(),
        })
    }

    pub fn block_count(&self) -> IndexResult<i64> {
        let count = self
            .db
            .query_one("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count.unwrap_or(0))
    }

    pub fn contains_block(&self, hash: &str) -> IndexResult<bool> {
        let found: Option<i64> = self
            .db
            .query_one("SELECT id FROM blocks WHERE hash = ?", params![hash], |row| row.get(0))?;
        Ok(found.is_some())
    }

    /// Writes a whole block in one unit of work. Nothing becomes visible unless
    /// every row and linkage update succeeds; a shutdown observed between
    /// transactions aborts the unit with `Cancelled`.
    pub fn persist(&self, set: &BlockWriteSet, shutdown: &Shutdown) -> IndexResult<PersistReport> {
        self.db.execute_transaction(|conn| {
            let writer = LedgerWriter::new(conn);
            let block_id = writer.insert_block(&set.block)?;

            let mut report = PersistReport {
                block_id,
                ..Default::default()
            };

            if set.block.height == 0 {
                return Ok(report);
            }

            for tx in &set.transactions {
                if shutdown.is_triggered() {
                    return Err(IndexError::Cancelled);
                }

                let transaction_id = writer.insert_transaction(tx, block_id)?;
                report.transactions += 1;

                // Outputs first: a later input in this same transaction list may spend them
                for output in &tx.outputs {
                    writer.insert_output(output, transaction_id)?;
                    report.outputs += 1;
                }

                for input in &tx.inputs {
                    let matched = writer.link_input(input, transaction_id)?;
                    match input {
                        InputLink::Coinbase(_) => report.coinbase_inputs += 1,
                        InputLink::Spend { .. } if matched == 0 => {
                            report.unlinked_inputs.push(input.to_string())
                        }
                        InputLink::Spend { .. } => report.linked_inputs += matched,
                    }
                }
            }

            Ok(report)
        })
    }
}

/// Row-level writes, bound to the connection of an open unit of work
pub struct LedgerWriter<'a> {
    conn: &'a Connection,
}

impl<'a> LedgerWriter<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn next_id(&self, table: &str) -> IndexResult<i64> {
        let id = self.conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", table),
            [],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Inserts one block row and returns its id. A hash that is already stored
    /// is a `Conflict`, never silently skipped.
    pub fn insert_block(&self, block: &BlockRecord) -> IndexResult<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row("SELECT id FROM blocks WHERE hash = ?", params![block.hash], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(IndexError::Conflict(block.hash.clone()));
        }

        let id = self.next_id("blocks")?;
        self.conn.execute(
            "INSERT INTO blocks (
                id, hash, confirmations, size, weight, version, merkle_root, time, median_time,
                height, difficulty, nonce, ntx, previous_block_hash, next_block_hash, indexed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                block.hash,
                block.confirmations,
                block.size,
                block.weight,
                block.version,
                block.merkle_root,
                block.time,
                block.median_time,
                block.height,
                block.difficulty,
                block.nonce,
                block.ntx,
                block.previous_block_hash,
                block.next_block_hash,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(id)
    }

    pub fn insert_transaction(&self, tx: &TransactionRecord, block_id: i64) -> IndexResult<i64> {
        let id = self.next_id("transactions")?;
        self.conn.execute(
            "INSERT INTO transactions (id, txid, hash, version, hex, locktime, block_id, weight, block_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                tx.txid,
                tx.hash,
                tx.version,
                tx.hex,
                tx.locktime,
                block_id,
                tx.weight,
                tx.block_time
            ],
        )?;
        Ok(id)
    }

    pub fn insert_output(&self, output: &OutputRecord, transaction_id: i64) -> IndexResult<()> {
        let addresses = serde_json::Value::from(output.script_pub_key_addresses.clone()).to_string();
        let id = self.next_id("transaction_outputs")?;

        self.conn.execute(
            "INSERT INTO transaction_outputs (
                id, output_transaction_id, value, vout_position, script_pub_key_asm,
                script_pub_key_hex, script_pub_key_req_sigs, script_pub_key_type,
                script_pub_key_addresses
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                transaction_id,
                output.value,
                output.vout_position,
                output.script_pub_key_asm,
                output.script_pub_key_hex,
                output.script_pub_key_req_sigs,
                output.script_pub_key_type,
                addresses
            ],
        )?;
        Ok(())
    }

    /// Records `spending_transaction_id` as the spender of the referenced output
    /// and returns the number of rows updated. Zero means the output is not in
    /// the store (or was already spent). A txid stored more than once resolves
    /// to its latest copy, which replaced the earlier one's outputs.
    ///
    /// A coinbase input has no predecessor; its marker is stamped on the outputs
    /// created by the spending transaction itself.
    pub fn link_input(&self, input: &InputLink, spending_transaction_id: i64) -> IndexResult<usize> {
        let updated = match input.columns() {
            (Some(spent_txid), Some(spent_position), _) => self.conn.execute(
                "UPDATE transaction_outputs
                 SET input_transaction_id = ?, input_vout_position = ?
                 WHERE vout_position = ?
                   AND input_transaction_id IS NULL
                   AND output_transaction_id = (
                       SELECT id FROM transactions WHERE txid = ? ORDER BY id DESC LIMIT 1
                   )",
                params![spending_transaction_id, spent_position, spent_position, spent_txid],
            )?,
            (_, _, Some(marker)) => self.conn.execute(
                "UPDATE transaction_outputs SET input_coinbase_id = ?
                 WHERE output_transaction_id = ? AND input_coinbase_id IS NULL",
                params![marker, spending_transaction_id],
            )?,
            _ => 0,
        };
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{self, hash};
    use crate::sync::shutdown_channel;

    fn repository() -> LedgerRepository {
        LedgerRepository::new(Database::in_memory().unwrap())
    }

    fn genesis() -> BlockWriteSet {
        BlockWriteSet {
            block: fixtures::block(0, None, Some(&hash("block-1"))),
            transactions: vec![],
        }
    }

    fn coinbase(txid: &str, outputs: usize) -> TransactionRecord {
        fixtures::transaction(
            txid,
            (0..outputs as i32).map(|n| fixtures::output(n, 50.0)).collect(),
            vec![InputLink::Coinbase("04ffff001d0104".to_string())],
        )
    }

    fn spend(txid: &str, spent_txid: &str, spent_position: i32) -> TransactionRecord {
        fixtures::transaction(
            txid,
            vec![fixtures::output(0, 10.0), fixtures::output(1, 39.0)],
            vec![InputLink::Spend {
                txid: spent_txid.to_string(),
                vout_position: spent_position,
            }],
        )
    }

    fn spender_of(repo: &LedgerRepository, txid: &str, position: i32) -> (Option<i64>, Option<i32>) {
        repo.database()
            .query_one(
                "SELECT o.input_transaction_id, o.input_vout_position
                 FROM transaction_outputs o JOIN transactions t ON t.id = o.output_transaction_id
                 WHERE t.txid = ? AND o.vout_position = ?",
                params![txid, position],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap()
            .unwrap()
    }

    fn transaction_id(repo: &LedgerRepository, txid: &str) -> i64 {
        repo.database()
            .query_one("SELECT id FROM transactions WHERE txid = ?", params![txid], |row| row.get(0))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_cursor_on_empty_store() {
        let repo = repository();
        assert!(repo.cursor().unwrap().is_empty());
        assert_eq!(repo.block_count().unwrap(), 0);
    }

    #[test]
    fn test_genesis_writes_no_transactions() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        let mut set = genesis();
        // Even if the payload carried one, genesis transactions are never stored
        set.transactions.push(coinbase(&hash("genesis-coinbase"), 1));

        let report = repo.persist(&set, &shutdown).unwrap();
        assert_eq!(report.block_id, 1);
        assert_eq!(report.transactions, 0);

        let stats = repo.database().get_stats().unwrap();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.tx_count, 0);
        assert_eq!(stats.output_count, 0);

        let cursor = repo.cursor().unwrap();
        assert_eq!(cursor.previous_block_hash, None);
        assert_eq!(cursor.next_block_hash, Some(hash("block-1")));
    }

    #[test]
    fn test_duplicate_block_is_conflict() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        repo.persist(&genesis(), &shutdown).unwrap();
        let err = repo.persist(&genesis(), &shutdown).unwrap_err();

        assert!(matches!(err, IndexError::Conflict(ref h) if *h == fixtures::block(0, None, None).hash));
        assert_eq!(repo.block_count().unwrap(), 1);
    }

    #[test]
    fn test_spend_within_same_block() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();
        repo.persist(&genesis(), &shutdown).unwrap();

        let funding = hash("tx-5-a");
        let spending = hash("tx-5-b");
        let set = BlockWriteSet {
            block: fixtures::block(5, Some(&hash("block-4")), Some(&hash("block-6"))),
            transactions: vec![coinbase(&funding, 2), spend(&spending, &funding, 0)],
        };

        let report = repo.persist(&set, &shutdown).unwrap();
        assert_eq!(report.transactions, 2);
        assert_eq!(report.outputs, 4);
        assert_eq!(report.linked_inputs, 1);
        assert_eq!(report.coinbase_inputs, 1);
        assert!(report.unlinked_inputs.is_empty());

        let spender = transaction_id(&repo, &spending);
        assert_eq!(spender_of(&repo, &funding, 0), (Some(spender), Some(0)));
        assert_eq!(spender_of(&repo, &funding, 1), (None, None));
    }

    #[test]
    fn test_spend_across_blocks() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        let funding = hash("tx-1");
        let first = BlockWriteSet {
            block: fixtures::block(1, Some(&hash("block-0")), Some(&hash("block-2"))),
            transactions: vec![coinbase(&funding, 2)],
        };
        repo.persist(&first, &shutdown).unwrap();

        let spending = hash("tx-2");
        let second = BlockWriteSet {
            block: fixtures::block(2, Some(&hash("block-1")), Some(&hash("block-3"))),
            transactions: vec![spend(&spending, &funding, 1)],
        };
        let report = repo.persist(&second, &shutdown).unwrap();
        assert_eq!(report.linked_inputs, 1);

        let spender = transaction_id(&repo, &spending);
        assert_eq!(spender_of(&repo, &funding, 1), (Some(spender), Some(1)));

        let block_ids: Vec<i64> = repo
            .database()
            .query_all("SELECT block_id FROM transactions ORDER BY id", [], |row| row.get(0))
            .unwrap();
        assert_eq!(block_ids, vec![1, 2]);
    }

    #[test]
    fn test_missing_output_is_reported_not_fatal() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        let orphan_parent = hash("never-seen");
        let set = BlockWriteSet {
            block: fixtures::block(1, Some(&hash("block-0")), Some(&hash("block-2"))),
            transactions: vec![spend(&hash("tx-x"), &orphan_parent, 3)],
        };

        let report = repo.persist(&set, &shutdown).unwrap();
        assert_eq!(report.linked_inputs, 0);
        assert_eq!(report.unlinked_inputs, vec![format!("{}:3", orphan_parent)]);
    }

    #[test]
    fn test_output_is_spent_at_most_once() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        let funding = hash("tx-f");
        let set = BlockWriteSet {
            block: fixtures::block(1, Some(&hash("block-0")), Some(&hash("block-2"))),
            transactions: vec![
                coinbase(&funding, 1),
                spend(&hash("tx-s1"), &funding, 0),
                spend(&hash("tx-s2"), &funding, 0),
            ],
        };

        let report = repo.persist(&set, &shutdown).unwrap();
        assert_eq!(report.linked_inputs, 1);
        assert_eq!(report.unlinked_inputs.len(), 1);

        let first_spender = transaction_id(&repo, &hash("tx-s1"));
        assert_eq!(spender_of(&repo, &funding, 0).0, Some(first_spender));
    }

    #[test]
    fn test_spend_of_duplicated_txid_marks_latest_copy_only() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        let duplicated = hash("dup");
        for height in 1..=2 {
            let set = BlockWriteSet {
                block: fixtures::block(
                    height,
                    Some(&hash(&format!("block-{}", height - 1))),
                    Some(&hash(&format!("block-{}", height + 1))),
                ),
                transactions: vec![coinbase(&duplicated, 1)],
            };
            repo.persist(&set, &shutdown).unwrap();
        }

        let set = BlockWriteSet {
            block: fixtures::block(3, Some(&hash("block-2")), Some(&hash("block-4"))),
            transactions: vec![spend(&hash("tx-spender"), &duplicated, 0)],
        };
        let report = repo.persist(&set, &shutdown).unwrap();
        assert_eq!(report.linked_inputs, 1);

        let spender = transaction_id(&repo, &hash("tx-spender"));
        let marked: Vec<(i64, Option<i64>)> = repo
            .database()
            .query_all(
                "SELECT o.output_transaction_id, o.input_transaction_id
                 FROM transaction_outputs o JOIN transactions t ON t.id = o.output_transaction_id
                 WHERE t.txid = ? ORDER BY o.output_transaction_id",
                params![duplicated],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(marked, vec![(1, None), (2, Some(spender))]);
        assert_eq!(repo.database().get_stats().unwrap().spent_output_count, 1);
    }

    #[test]
    fn test_coinbase_marker_stamped_on_own_outputs() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        let minted = hash("tx-coinbase");
        let set = BlockWriteSet {
            block: fixtures::block(1, Some(&hash("block-0")), Some(&hash("block-2"))),
            transactions: vec![coinbase(&minted, 2)],
        };
        let report = repo.persist(&set, &shutdown).unwrap();
        assert_eq!(report.coinbase_inputs, 1);

        let rows: Vec<(Option<String>, Option<i64>, Option<i32>)> = repo
            .database()
            .query_all(
                "SELECT o.input_coinbase_id, o.input_transaction_id, o.input_vout_position
                 FROM transaction_outputs o JOIN transactions t ON t.id = o.output_transaction_id
                 WHERE t.txid = ? ORDER BY o.vout_position",
                params![minted],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        let marker = Some("04ffff001d0104".to_string());
        assert_eq!(rows, vec![(marker.clone(), None, None), (marker, None, None)]);
    }

    #[test]
    fn test_failed_output_insert_discards_whole_block() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();
        repo.persist(&genesis(), &shutdown).unwrap();

        // Two outputs sharing a position violate the (transaction, position) key
        let mut broken = coinbase(&hash("tx-3"), 1);
        broken.outputs.push(fixtures::output(0, 1.0));

        let set = BlockWriteSet {
            block: fixtures::block(1, Some(&hash("block-0")), Some(&hash("block-2"))),
            transactions: vec![coinbase(&hash("tx-1"), 1), coinbase(&hash("tx-2"), 2), broken],
        };

        let err = repo.persist(&set, &shutdown).unwrap_err();
        assert!(matches!(err, IndexError::StoreUnavailable(_)));

        let stats = repo.database().get_stats().unwrap();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.tx_count, 0);
        assert_eq!(stats.output_count, 0);
        assert!(!repo.contains_block(&set.block.hash).unwrap());
    }

    #[test]
    fn test_shutdown_aborts_open_unit_of_work() {
        let repo = repository();
        let (trigger, shutdown) = shutdown_channel();
        trigger.fire();

        let set = BlockWriteSet {
            block: fixtures::block(1, Some(&hash("block-0")), Some(&hash("block-2"))),
            transactions: vec![coinbase(&hash("tx-1"), 1)],
        };

        let err = repo.persist(&set, &shutdown).unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));
        assert_eq!(repo.block_count().unwrap(), 0);
    }

    #[test]
    fn test_reset_clears_and_restarts_identities() {
        let repo = repository();
        let (_trigger, shutdown) = shutdown_channel();

        repo.persist(&genesis(), &shutdown).unwrap();
        let set = BlockWriteSet {
            block: fixtures::block(1, Some(&hash("block-0")), Some(&hash("block-2"))),
            transactions: vec![coinbase(&hash("tx-1"), 2)],
        };
        repo.persist(&set, &shutdown).unwrap();

        repo.reset().unwrap();

        let stats = repo.database().get_stats().unwrap();
        assert_eq!((stats.block_count, stats.tx_count, stats.output_count), (0, 0, 0));
        assert!(repo.cursor().unwrap().is_empty());

        let report = repo.persist(&genesis(), &shutdown).unwrap();
        assert_eq!(report.block_id, 1);
        let report = repo.persist(&set, &shutdown).unwrap();
        assert_eq!(report.block_id, 2);
        assert_eq!(transaction_id(&repo, &hash("tx-1")), 1);

        let output_ids: Vec<i64> = repo
            .database()
            .query_all("SELECT id FROM transaction_outputs ORDER BY id", [], |row| row.get(0))
            .unwrap();
        assert_eq!(output_ids, vec![1, 2]);
    }
}
