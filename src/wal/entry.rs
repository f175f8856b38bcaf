//! WAL record format
//!
//! Variable-length framed records (all little-endian):
//! ┌────────┬────────┬────────┬─────────┬────┬──────────────────────┐
//! │ Magic  │ Length │ CRC32  │ Epoch   │ Op │ Entry body           │
//! │ 4 bytes│ 4 bytes│ 4 bytes│ 8 bytes │ 1B │ Length - 9 bytes     │
//! └────────┴────────┴────────┴─────────┴────┴──────────────────────┘
//!
//! `Length` counts everything after the CRC field; the CRC covers the same
//! region, so a torn tail or bit flip is caught before any field is trusted.

use crate::defaults::WAL_MAGIC;
use crate::types::{Epoch, OpKind, Timestamp, VectorEntry, VectorId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on a single record; anything larger is treated as corruption
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// A committed write as persisted in the log
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub epoch: Epoch,
    pub op: OpKind,
    pub timestamp: Timestamp,
    pub entry: VectorEntry,
}

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("invalid WAL magic number")]
    InvalidMagic,

    #[error("CRC checksum mismatch")]
    ChecksumMismatch,

    #[error("truncated record")]
    TruncatedRecord,

    #[error("unknown operation kind: {0}")]
    UnknownOp(u8),

    #[error("record length {0} exceeds limit")]
    RecordTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WalRecord {
    /// Serialize the record to its framed wire form
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u64_le(self.timestamp);
        put_bytes(&mut body, self.entry.id.as_bytes());
        put_str(&mut body, &self.entry.tenant);
        put_str(&mut body, &self.entry.namespace);
        body.put_u8(self.entry.tags.len() as u8);
        for &tag in &self.entry.tags {
            body.put_u32_le(tag);
        }
        body.put_u16_le(self.entry.centroid_id);
        body.put_u8(self.entry.deleted as u8);
        body.put_u64_le(self.entry.created_at);
        body.put_u64_le(self.entry.updated_at);
        body.put_u32_le(self.entry.vector.len() as u32);
        for &value in &self.entry.vector {
            body.put_f32_le(value);
        }

        // Region covered by both Length and CRC: epoch, op, body
        let mut covered = BytesMut::with_capacity(9 + body.len());
        covered.put_u64_le(self.epoch);
        covered.put_u8(self.op.as_u8());
        covered.extend_from_slice(&body);

        let mut frame = BytesMut::with_capacity(12 + covered.len());
        frame.put_u32_le(WAL_MAGIC);
        frame.put_u32_le(covered.len() as u32);
        frame.put_u32_le(crc32fast::hash(&covered));
        frame.extend_from_slice(&covered);
        frame.freeze()
    }

    /// Parse one record from the front of `data`; returns the record and the
    /// number of bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize), WalError> {
        if data.len() < 12 {
            return Err(WalError::TruncatedRecord);
        }
        let mut header = &data[..12];
        let magic = header.get_u32_le();
        if magic != WAL_MAGIC {
            return Err(WalError::InvalidMagic);
        }
        let len = header.get_u32_le() as usize;
        if len > MAX_RECORD_LEN {
            return Err(WalError::RecordTooLarge(len));
        }
        let stored_crc = header.get_u32_le();

        if data.len() < 12 + len {
            return Err(WalError::TruncatedRecord);
        }
        let covered = &data[12..12 + len];
        if crc32fast::hash(covered) != stored_crc {
            return Err(WalError::ChecksumMismatch);
        }

        let mut buf = covered;
        let epoch = get_u64(&mut buf)?;
        let op_raw = get_u8(&mut buf)?;
        let op = OpKind::from_u8(op_raw).ok_or(WalError::UnknownOp(op_raw))?;

        let timestamp = get_u64(&mut buf)?;
        let id = VectorId::from(get_bytes(&mut buf)?);
        let tenant = get_string(&mut buf)?;
        let namespace = get_string(&mut buf)?;

        let tag_count = get_u8(&mut buf)? as usize;
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(get_u32(&mut buf)?);
        }

        let centroid_id = get_u16(&mut buf)?;
        let deleted = get_u8(&mut buf)? != 0;
        let created_at = get_u64(&mut buf)?;
        let updated_at = get_u64(&mut buf)?;

        let dim = get_u32(&mut buf)? as usize;
        if buf.remaining() < dim * 4 {
            return Err(WalError::TruncatedRecord);
        }
        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            vector.push(buf.get_f32_le());
        }

        let id_hash = crate::hash::identity_hash(id.as_bytes());
        let entry = VectorEntry {
            id,
            id_hash,
            vector,
            tenant,
            namespace,
            tags,
            created_at,
            updated_at,
            centroid_id,
            deleted,
        };

        Ok((
            Self {
                epoch,
                op,
                timestamp,
                entry,
            },
            12 + len,
        ))
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, WalError> {
    if buf.remaining() < 1 {
        return Err(WalError::TruncatedRecord);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, WalError> {
    if buf.remaining() < 2 {
        return Err(WalError::TruncatedRecord);
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, WalError> {
    if buf.remaining() < 4 {
        return Err(WalError::TruncatedRecord);
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, WalError> {
    if buf.remaining() < 8 {
        return Err(WalError::TruncatedRecord);
    }
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, WalError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(WalError::TruncatedRecord);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_string(buf: &mut &[u8]) -> Result<String, WalError> {
    String::from_utf8(get_bytes(buf)?).map_err(|_| WalError::TruncatedRecord)
}
