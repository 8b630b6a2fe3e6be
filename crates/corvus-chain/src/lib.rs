//! # corvus-chain
//!
//! Block model and chain-side contracts for the corvus node.
//!
//! This crate provides:
//! - The block and block-head types with their binary codec
//! - The block-cache and blockchain contracts the synchronizer consumes
//! - The node operating mode and its single-writer holder

mod block;
mod cache;
mod error;
mod mode;

pub use block::{Block, BlockHead, HASH_LEN};
pub use cache::{BlockCache, Blockchain, CacheNode, LinkKind};
pub use error::{ChainError, ChainResult};
pub use mode::{Mode, ModeCell};
