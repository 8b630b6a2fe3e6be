//! Sync protocol messages and wire codec.
//!
//! Every message is schema-tagged binary: a one-byte tag, fixed-width
//! big-endian integers, and VLQ length prefixes for variable fields.

use crate::{P2pError, P2pResult, PeerId};
use bytes::{BufMut, Bytes, BytesMut};

/// VLQ decode an unsigned integer.
fn vlq_decode(data: &[u8], mut pos: usize) -> P2pResult<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        if pos >= data.len() {
            return Err(P2pError::Codec("Truncated VLQ".into()));
        }
        let byte = data[pos];
        pos += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }
        shift += 7;

        if shift > 63 {
            return Err(P2pError::Codec("VLQ overflow".into()));
        }
    }

    Ok((result, pos))
}

/// VLQ encode an unsigned integer.
fn vlq_encode(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read a big-endian i64.
fn read_i64(data: &[u8], pos: usize) -> P2pResult<(i64, usize)> {
    if pos + 8 > data.len() {
        return Err(P2pError::Codec("Truncated i64".into()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[pos..pos + 8]);
    Ok((i64::from_be_bytes(raw), pos + 8))
}

/// Read a VLQ-length-prefixed byte field.
fn read_bytes(data: &[u8], pos: usize) -> P2pResult<(Vec<u8>, usize)> {
    let (len, pos) = vlq_decode(data, pos)?;
    let len = len as usize;
    if pos + len > data.len() {
        return Err(P2pError::Codec("Truncated byte field".into()));
    }
    Ok((data[pos..pos + len].to_vec(), pos + len))
}

/// Check and consume the schema tag.
fn expect_tag(data: &[u8], tag: u8) -> P2pResult<usize> {
    match data.first() {
        Some(&b) if b == tag => Ok(1),
        Some(&b) => Err(P2pError::Codec(format!(
            "Schema tag mismatch: got {}, expected {}",
            b, tag
        ))),
        None => Err(P2pError::Codec("Empty message".into())),
    }
}

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Peer height gossip.
    SyncHeight = 1,
    /// Ranged or by-number block hash query.
    BlockHashQuery = 2,
    /// Hashes answering a query.
    BlockHashResponse = 3,
    /// Request for a single block by hash.
    BlockRequest = 4,
    /// Encoded block bytes.
    BlockResponse = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = P2pError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::SyncHeight),
            2 => Ok(MessageKind::BlockHashQuery),
            3 => Ok(MessageKind::BlockHashResponse),
            4 => Ok(MessageKind::BlockRequest),
            5 => Ok(MessageKind::BlockResponse),
            _ => Err(P2pError::Codec(format!("Unknown message kind: {}", value))),
        }
    }
}

/// Delivery priority.
///
/// Queries and block requests go out urgent; responses go out normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Delivered ahead of normal traffic.
    Urgent,
    /// Default lane.
    Normal,
}

/// A message delivered by the transport.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Sending peer.
    pub from: PeerId,
    /// Message kind.
    pub kind: MessageKind,
    /// Undecoded body.
    pub data: Bytes,
}

/// Height gossip payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHeight {
    /// Reporter's head number.
    pub height: i64,
    /// Reporter's clock (unix seconds).
    pub time: i64,
}

impl SyncHeight {
    /// Serialize to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageKind::SyncHeight as u8);
        buf.put_i64(self.height);
        buf.put_i64(self.time);
        buf.freeze()
    }

    /// Parse from bytes.
    pub fn decode(data: &[u8]) -> P2pResult<Self> {
        let pos = expect_tag(data, MessageKind::SyncHeight as u8)?;
        let (height, pos) = read_i64(data, pos)?;
        let (time, _) = read_i64(data, pos)?;
        Ok(Self { height, time })
    }
}

/// Form of a block hash query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryKind {
    /// Hashes for the closed range `[start, end]`.
    Range = 0,
    /// Hashes for each listed number.
    ByNumber = 1,
}

impl TryFrom<u8> for QueryKind {
    type Error = P2pError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QueryKind::Range),
            1 => Ok(QueryKind::ByNumber),
            _ => Err(P2pError::Codec(format!("Unknown query kind: {}", value))),
        }
    }
}

/// Block hash query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHashQuery {
    /// Range or by-number.
    pub req_type: QueryKind,
    /// First number of a range query.
    pub start: i64,
    /// Last number of a range query.
    pub end: i64,
    /// Numbers of a by-number query.
    pub nums: Vec<i64>,
}

impl BlockHashQuery {
    /// Serialize to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + 8 + 8 + 2 + 8 * self.nums.len());
        buf.put_u8(MessageKind::BlockHashQuery as u8);
        buf.put_u8(self.req_type as u8);
        buf.put_i64(self.start);
        buf.put_i64(self.end);
        vlq_encode(&mut buf, self.nums.len() as u64);
        for num in &self.nums {
            buf.put_i64(*num);
        }
        buf.freeze()
    }

    /// Parse from bytes.
    pub fn decode(data: &[u8]) -> P2pResult<Self> {
        let pos = expect_tag(data, MessageKind::BlockHashQuery as u8)?;
        if pos >= data.len() {
            return Err(P2pError::Codec("Truncated query kind".into()));
        }
        let req_type = QueryKind::try_from(data[pos])?;
        let (start, pos) = read_i64(data, pos + 1)?;
        let (end, pos) = read_i64(data, pos)?;
        let (count, mut pos) = vlq_decode(data, pos)?;
        let mut nums = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (num, next) = read_i64(data, pos)?;
            nums.push(num);
            pos = next;
        }
        Ok(Self {
            req_type,
            start,
            end,
            nums,
        })
    }
}

/// Number-and-hash pair; also the body of a block request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block number.
    pub number: i64,
    /// Block hash.
    pub hash: Vec<u8>,
}

impl BlockInfo {
    /// Serialize as a standalone block request.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + 8 + 1 + self.hash.len());
        buf.put_u8(MessageKind::BlockRequest as u8);
        self.put_fields(&mut buf);
        buf.freeze()
    }

    /// Parse a standalone block request.
    pub fn decode(data: &[u8]) -> P2pResult<Self> {
        let pos = expect_tag(data, MessageKind::BlockRequest as u8)?;
        let (info, _) = Self::read_fields(data, pos)?;
        Ok(info)
    }

    fn put_fields(&self, buf: &mut BytesMut) {
        buf.put_i64(self.number);
        vlq_encode(buf, self.hash.len() as u64);
        buf.put_slice(&self.hash);
    }

    fn read_fields(data: &[u8], pos: usize) -> P2pResult<(Self, usize)> {
        let (number, pos) = read_i64(data, pos)?;
        let (hash, pos) = read_bytes(data, pos)?;
        Ok((Self { number, hash }, pos))
    }
}

/// Block hash response.
///
/// Block infos are in ascending number order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHashResponse {
    /// Answered (number, hash) pairs.
    pub block_infos: Vec<BlockInfo>,
}

impl BlockHashResponse {
    /// Serialize to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.block_infos.len() * 44);
        buf.put_u8(MessageKind::BlockHashResponse as u8);
        vlq_encode(&mut buf, self.block_infos.len() as u64);
        for info in &self.block_infos {
            info.put_fields(&mut buf);
        }
        buf.freeze()
    }

    /// Parse from bytes.
    pub fn decode(data: &[u8]) -> P2pResult<Self> {
        let pos = expect_tag(data, MessageKind::BlockHashResponse as u8)?;
        let (count, mut pos) = vlq_decode(data, pos)?;
        let mut block_infos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (info, next) = BlockInfo::read_fields(data, pos)?;
            block_infos.push(info);
            pos = next;
        }
        Ok(Self { block_infos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_height_roundtrip() {
        let msg = SyncHeight {
            height: 12_345,
            time: 1_700_000_000,
        };
        let decoded = SyncHeight::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_hash_query_roundtrip() {
        let range = BlockHashQuery {
            req_type: QueryKind::Range,
            start: 101,
            end: 200,
            nums: vec![],
        };
        assert_eq!(range, BlockHashQuery::decode(&range.encode()).unwrap());

        let by_number = BlockHashQuery {
            req_type: QueryKind::ByNumber,
            start: 0,
            end: 0,
            nums: vec![3, 5, 7],
        };
        assert_eq!(
            by_number,
            BlockHashQuery::decode(&by_number.encode()).unwrap()
        );
    }

    #[test]
    fn test_hash_response_roundtrip() {
        let resp = BlockHashResponse {
            block_infos: vec![
                BlockInfo {
                    number: 1,
                    hash: vec![0xAA; 32],
                },
                BlockInfo {
                    number: 2,
                    hash: vec![0xBB; 32],
                },
            ],
        };
        assert_eq!(resp, BlockHashResponse::decode(&resp.encode()).unwrap());
    }

    #[test]
    fn test_block_request_roundtrip() {
        let req = BlockInfo {
            number: 150,
            hash: vec![0xCD; 32],
        };
        assert_eq!(req, BlockInfo::decode(&req.encode()).unwrap());
    }

    #[test]
    fn test_decode_rejects_wrong_tag() {
        let msg = SyncHeight {
            height: 1,
            time: 2,
        };
        assert!(BlockHashQuery::decode(&msg.encode()).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = BlockHashResponse {
            block_infos: vec![BlockInfo {
                number: 9,
                hash: vec![1; 32],
            }],
        }
        .encode();
        assert!(BlockHashResponse::decode(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_vlq_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            vlq_encode(&mut buf, value);
            let (decoded, used) = vlq_decode(&buf, 0).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }
}
