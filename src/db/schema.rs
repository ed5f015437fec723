/// Database migrations - each tuple is (name, SQL)
pub const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_ledger_schema",
        r#"
        -- Ids are assigned by the ledger writer as MAX(id) + 1, so clearing a
        -- relation also restarts its identities. block_id and
        -- output_transaction_id reference the parent ids without FK constraints.

        -- Blocks table
        CREATE TABLE IF NOT EXISTS blocks (
            id BIGINT PRIMARY KEY,
            hash VARCHAR(64) NOT NULL UNIQUE,
            confirmations BIGINT NOT NULL,
            size BIGINT NOT NULL,
            weight BIGINT NOT NULL,
            version INTEGER NOT NULL,
            merkle_root VARCHAR(64) NOT NULL,
            time BIGINT NOT NULL,
            median_time BIGINT NOT NULL,
            height BIGINT NOT NULL,
            difficulty DOUBLE NOT NULL,
            nonce BIGINT NOT NULL,
            ntx INTEGER NOT NULL,
            previous_block_hash VARCHAR(64),
            next_block_hash VARCHAR(64),
            indexed_at BIGINT NOT NULL
        );

        -- Transactions table
        CREATE TABLE IF NOT EXISTS transactions (
            id BIGINT PRIMARY KEY,
            txid VARCHAR(64) NOT NULL,
            hash VARCHAR(64) NOT NULL,
            version BIGINT NOT NULL,
            hex TEXT NOT NULL,
            locktime BIGINT NOT NULL,
            block_id BIGINT NOT NULL,
            weight BIGINT NOT NULL,
            block_time BIGINT
        );

        -- Outputs; the input_* columns record the spender once known
        CREATE TABLE IF NOT EXISTS transaction_outputs (
            id BIGINT PRIMARY KEY,
            output_transaction_id BIGINT NOT NULL,
            value DOUBLE NOT NULL,
            vout_position INTEGER NOT NULL,
            script_pub_key_asm TEXT NOT NULL,
            script_pub_key_hex TEXT NOT NULL,
            script_pub_key_req_sigs INTEGER NOT NULL,
            script_pub_key_type VARCHAR(32) NOT NULL,
            script_pub_key_addresses TEXT NOT NULL,
            input_transaction_id BIGINT,
            input_vout_position INTEGER,
            input_coinbase_id TEXT,
            UNIQUE (output_transaction_id, vout_position)
        );
        "#,
    ),
    (
        "002_lookup_indexes",
        r#"
        CREATE INDEX IF NOT EXISTS idx_transactions_txid ON transactions(txid);
        CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions(block_id);
        CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks(height);
        "#,
    ),
];

/// Empties the ledger relations children-first
pub const CLEAR_LEDGER: &str = r#"
    DELETE FROM transaction_outputs;
    DELETE FROM transactions;
    DELETE FROM blocks;
"#;
