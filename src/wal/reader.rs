//! WAL replay logic

use super::entry::{WalError, WalRecord};
use std::path::Path;

/// Replay records from a WAL file, skipping epochs at or below `after_epoch`
pub async fn replay_path(
    path: impl AsRef<Path>,
    after_epoch: u64,
) -> Result<Vec<WalRecord>, WalError> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(data) => replay_from_bytes(&data, after_epoch),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Replay records from a byte buffer
///
/// Scanning stops cleanly at a torn tail: an invalid magic, checksum
/// mismatch, or truncated frame ends the replay rather than failing it,
/// since anything past that point was never acknowledged.
pub fn replay_from_bytes(data: &[u8], after_epoch: u64) -> Result<Vec<WalRecord>, WalError> {
    scan_valid_prefix(data, after_epoch).map(|(records, _)| records)
}

/// Replay records and report the byte length of the valid prefix
///
/// The caller truncates the log to this length before appending again, so a
/// torn tail can never hide later records from replay.
pub fn scan_valid_prefix(
    data: &[u8],
    after_epoch: u64,
) -> Result<(Vec<WalRecord>, usize), WalError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match WalRecord::decode(&data[offset..]) {
            Ok((record, consumed)) => {
                if record.epoch > after_epoch {
                    records.push(record);
                }
                offset += consumed;
            }
            Err(WalError::InvalidMagic) => break,
            Err(WalError::ChecksumMismatch) => {
                tracing::warn!(offset, "WAL corruption detected, stopping replay");
                break;
            }
            Err(WalError::TruncatedRecord) | Err(WalError::RecordTooLarge(_)) => {
                tracing::warn!(offset, "torn WAL tail, stopping replay");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok((records, offset))
}
