//! Block model and binary codec.

use crate::{ChainError, ChainResult};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of a block hash in bytes (blake2b-256).
pub const HASH_LEN: usize = 32;

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHead {
    /// Block number (height).
    pub number: i64,
    /// Hash of the parent block.
    pub parent_hash: Vec<u8>,
    /// Identity of the producer.
    pub witness: String,
    /// Production time (unix seconds).
    pub time: i64,
}

impl BlockHead {
    /// Serialize the head to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            8 + 8 + 4 + self.parent_hash.len() + 4 + self.witness.len(),
        );
        buf.put_i64(self.number);
        buf.put_i64(self.time);
        buf.put_u32(self.parent_hash.len() as u32);
        buf.put_slice(&self.parent_hash);
        buf.put_u32(self.witness.len() as u32);
        buf.put_slice(self.witness.as_bytes());
        buf.freeze()
    }

    /// Parse a head from bytes, returning the remainder.
    fn decode(mut data: &[u8]) -> ChainResult<(Self, &[u8])> {
        if data.remaining() < 16 {
            return Err(ChainError::Malformed("truncated block head".into()));
        }
        let number = data.get_i64();
        let time = data.get_i64();
        let parent_hash = read_field(&mut data, "parent hash")?;
        let witness_bytes = read_field(&mut data, "witness")?;
        let witness = String::from_utf8(witness_bytes)
            .map_err(|_| ChainError::Malformed("witness is not utf-8".into()))?;
        Ok((
            Self {
                number,
                parent_hash,
                witness,
                time,
            },
            data,
        ))
    }

    /// Hash of the encoded head (blake2b-256).
    pub fn hash(&self) -> Vec<u8> {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.encode());
        hasher.finalize().to_vec()
    }
}

/// A block: head plus an opaque body payload.
///
/// The synchronizer moves blocks around without inspecting the body;
/// execution and validation live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block header.
    pub head: BlockHead,
    /// Opaque body bytes (transactions, receipts).
    pub payload: Vec<u8>,
}

impl Block {
    /// Hash identifying the block (hash of the head).
    pub fn hash(&self) -> Vec<u8> {
        self.head.hash()
    }

    /// Serialize the block to bytes.
    pub fn encode(&self) -> Bytes {
        let head = self.head.encode();
        let mut buf = BytesMut::with_capacity(head.len() + 4 + self.payload.len());
        buf.put_slice(&head);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a block from bytes.
    pub fn decode(data: &[u8]) -> ChainResult<Self> {
        let (head, mut rest) = BlockHead::decode(data)?;
        let payload = read_field(&mut rest, "payload")?;
        if !rest.is_empty() {
            return Err(ChainError::Malformed("trailing bytes after block".into()));
        }
        Ok(Self { head, payload })
    }
}

/// Read a u32-length-prefixed field.
fn read_field(data: &mut &[u8], what: &str) -> ChainResult<Vec<u8>> {
    if data.remaining() < 4 {
        return Err(ChainError::Malformed(format!("truncated {} length", what)));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(ChainError::Malformed(format!("truncated {}", what)));
    }
    let field = data[..len].to_vec();
    data.advance(len);
    Ok(field)
}
