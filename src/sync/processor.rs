//! Block transformer: shapes fetched payloads into the relational write set

use crate::error::SourceError;
use crate::models::{BlockRecord, BlockWriteSet, InputLink, OutputRecord, TransactionRecord};

use super::node_client::{BlockPayload, TransactionPayload, VinPayload, VoutPayload};

/// Maps a block and its fetched transactions (in listed order) to a write set.
/// Genesis never yields transactions, whatever was passed in.
pub fn transform(
    block: &BlockPayload,
    transactions: &[TransactionPayload],
) -> Result<BlockWriteSet, SourceError> {
    let record = BlockRecord {
        hash: checked_hash("block hash", &block.hash)?,
        confirmations: block.confirmations,
        size: block.size,
        weight: block.weight,
        version: block.version,
        merkle_root: block.merkle_root.clone(),
        time: block.time,
        median_time: block.median_time,
        height: block.height,
        difficulty: block.difficulty,
        nonce: block.nonce,
        ntx: block.n_tx.unwrap_or(block.transactions.len() as i32),
        previous_block_hash: optional_hash("previous block hash", block.previous_block_hash.as_deref())?,
        next_block_hash: optional_hash("next block hash", block.successor())?,
    };

    if block.height == 0 {
        return Ok(BlockWriteSet {
            block: record,
            transactions: Vec::new(),
        });
    }

    if transactions.len() != block.transactions.len() {
        return Err(SourceError::Malformed(format!(
            "block {} lists {} transactions, got {}",
            block.hash,
            block.transactions.len(),
            transactions.len()
        )));
    }

    let transactions = block
        .transactions
        .iter()
        .zip(transactions)
        .map(|(listed, tx)| {
            if *listed != tx.txid {
                return Err(SourceError::Malformed(format!(
                    "block {} lists {} but the source returned {}",
                    block.hash, listed, tx.txid
                )));
            }
            collect_transaction(tx)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BlockWriteSet {
        block: record,
        transactions,
    })
}

fn collect_transaction(tx: &TransactionPayload) -> Result<TransactionRecord, SourceError> {
    let outputs = tx.vout.iter().map(collect_output).collect();
    let inputs = tx
        .vin
        .iter()
        .map(|vin| collect_input(&tx.txid, vin))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TransactionRecord {
        txid: checked_hash("txid", &tx.txid)?,
        hash: tx.hash.clone(),
        version: tx.version,
        hex: tx.hex.clone(),
        locktime: tx.locktime,
        weight: tx.weight,
        block_time: tx.block_time,
        outputs,
        inputs,
    })
}

fn collect_output(vout: &VoutPayload) -> OutputRecord {
    let script = &vout.script_pub_key;
    OutputRecord {
        value: vout.value,
        vout_position: vout.n,
        script_pub_key_asm: script.asm.clone(),
        script_pub_key_hex: script.hex.clone(),
        script_pub_key_req_sigs: script.req_sigs.unwrap_or(0),
        script_pub_key_type: script.kind.clone(),
        script_pub_key_addresses: script.all_addresses(),
    }
}

fn collect_input(spending_txid: &str, vin: &VinPayload) -> Result<InputLink, SourceError> {
    if let Some(coinbase) = &vin.coinbase {
        return Ok(InputLink::Coinbase(coinbase.clone()));
    }

    match (&vin.txid, vin.vout) {
        (Some(txid), Some(vout_position)) => Ok(InputLink::Spend {
            txid: checked_hash("spent txid", txid)?,
            vout_position,
        }),
        _ => Err(SourceError::Malformed(format!(
            "input of {} has neither coinbase nor txid/vout",
            spending_txid
        ))),
    }
}

/// Hashes and txids are 32 bytes, hex encoded
fn checked_hash(field: &str, value: &str) -> Result<String, SourceError> {
    match hex::decode(value) {
        Ok(bytes) if bytes.len() == 32 => Ok(value.to_ascii_lowercase()),
        _ => Err(SourceError::Malformed(format!("{} is not a 32-byte hex hash: {:?}", field, value))),
    }
}

fn optional_hash(field: &str, value: Option<&str>) -> Result<Option<String>, SourceError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => checked_hash(field, v).map(Some),
        None => Ok(None),
    }
}
