//! Parsing of exported purchase batches used to backfill the event log.
//!
//! A batch is a CSV file with a header row, optionally wrapped in an LZ4 frame.

use crate::domain::RawPurchase;
use std::io::Read;
use thiserror::Error;

/// First four bytes of every LZ4 frame.
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("lz4 decode error: {0}")]
    Lz4(String),
    #[error("csv parse error: {0}")]
    Csv(String),
}

pub fn is_lz4_frame(bytes: &[u8]) -> bool {
    bytes.starts_with(&LZ4_FRAME_MAGIC)
}

pub fn decompress_lz4_frame(lz4_bytes: &[u8]) -> Result<Vec<u8>, ImportError> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(lz4_bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ImportError::Lz4(e.to_string()))?;
    Ok(out)
}

/// Parse a purchase batch into raw purchases, decompressing first if needed.
///
/// Field contents are not validated here; intake does that per row so that
/// bad rows are dead-lettered individually.
pub fn parse_purchases(bytes: &[u8]) -> Result<Vec<RawPurchase>, ImportError> {
    if is_lz4_frame(bytes) {
        let csv = decompress_lz4_frame(bytes)?;
        parse_csv(&csv)
    } else {
        parse_csv(bytes)
    }
}

fn parse_csv(csv_bytes: &[u8]) -> Result<Vec<RawPurchase>, ImportError> {
    #[derive(Debug, serde::Deserialize)]
    struct Row {
        event_id: String,
        purchaser_id: String,
        amount: String,
        currency: String,
        #[serde(default)]
        product_kind: String,
        occurred_at_ms: i64,
        #[serde(default)]
        source_ref: Option<String>,
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_bytes);

    let mut purchases = Vec::new();
    for (i, record) in reader.deserialize::<Row>().enumerate() {
        let row = record.map_err(|e| ImportError::Csv(format!("row {}: {}", i + 1, e)))?;
        purchases.push(RawPurchase {
            event_id: row.event_id,
            purchaser_id: row.purchaser_id,
            amount: row.amount,
            currency: row.currency,
            product_kind: row.product_kind,
            occurred_at_ms: row.occurred_at_ms,
            source_ref: row.source_ref.filter(|s| !s.is_empty()),
        });
    }

    Ok(purchases)
}
