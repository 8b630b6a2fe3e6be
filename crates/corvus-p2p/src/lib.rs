//! # corvus-p2p
//!
//! P2P surface consumed by the corvus synchronizer.
//!
//! This crate provides:
//! - Peer identifiers
//! - Sync protocol messages and their wire codec
//! - The transport contract (`PeerService`) with broadcast and unicast

mod error;
mod message;
mod peer;
mod service;

pub use error::{P2pError, P2pResult};
pub use message::{
    BlockHashQuery, BlockHashResponse, BlockInfo, IncomingMessage, MessageKind, Priority,
    QueryKind, SyncHeight,
};
pub use peer::PeerId;
pub use service::PeerService;
