//! Test data generators.
//!
//! Deterministic blocks and chains for synchronizer tests. Payloads
//! are random bytes; identities come from block heads, so randomness
//! never affects hashes relevant to assertions.

use corvus_chain::{Block, BlockHead, HASH_LEN};
use rand::RngCore;

/// A deterministic 32-byte hash from a seed.
pub fn test_hash(seed: u8) -> Vec<u8> {
    let mut hash = vec![0u8; HASH_LEN];
    hash[0] = seed;
    hash[HASH_LEN - 1] = seed.wrapping_mul(7);
    hash
}

/// A block with the given number, witness, and parent.
pub fn make_block(number: i64, witness: &str, parent_hash: Vec<u8>) -> Block {
    let mut payload = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut payload);
    Block {
        head: BlockHead {
            number,
            parent_hash,
            witness: witness.to_string(),
            time: 1_700_000_000 + number,
        },
        payload,
    }
}

/// A parent-linked chain of `len` blocks numbered from 0, witnesses
/// assigned round-robin.
pub fn build_chain(len: i64, witnesses: &[&str]) -> Vec<Block> {
    assert!(!witnesses.is_empty());
    let mut blocks = Vec::with_capacity(len as usize);
    let mut parent_hash = vec![0u8; HASH_LEN];
    for number in 0..len {
        let witness = witnesses[(number as usize) % witnesses.len()];
        let block = make_block(number, witness, parent_hash);
        parent_hash = block.hash();
        blocks.push(block);
    }
    blocks
}

/// Extend `blocks` by `count` more, each produced by `witness`.
pub fn extend_chain(blocks: &mut Vec<Block>, count: i64, witness: &str) {
    let (mut number, mut parent_hash) = match blocks.last() {
        Some(last) => (last.head.number + 1, last.hash()),
        None => (0, vec![0u8; HASH_LEN]),
    };
    for _ in 0..count {
        let block = make_block(number, witness, parent_hash);
        parent_hash = block.hash();
        number += 1;
        blocks.push(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_chain_links_parents() {
        let blocks = build_chain(5, &["a", "b"]);
        assert_eq!(blocks.len(), 5);
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].head.parent_hash, pair[0].hash());
            assert_eq!(pair[1].head.number, pair[0].head.number + 1);
        }
        assert_eq!(blocks[0].head.witness, "a");
        assert_eq!(blocks[1].head.witness, "b");
        assert_eq!(blocks[2].head.witness, "a");
    }

    #[test]
    fn test_extend_chain_continues_numbering() {
        let mut blocks = build_chain(3, &["a"]);
        extend_chain(&mut blocks, 2, "z");
        assert_eq!(blocks.len(), 5);
        assert_eq!(blocks[4].head.number, 4);
        assert_eq!(blocks[4].head.witness, "z");
        assert_eq!(blocks[3].head.parent_hash, blocks[2].hash());
    }
}
