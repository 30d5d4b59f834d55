//! Interfaces the external swarm engine implements.
//!
//! The engine owns peer discovery, piece selection, choking and the base
//! peer-wire framing. The client only sees torrents as opaque handles and
//! peer connections as a channel that can carry extension messages.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use bytes::Bytes;
use url::Url;
use crate::InfoHash;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {

    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("torrent rejected by engine: {0}")]
    Rejected(String),

    #[error("peer connection closed")]
    PeerClosed,

    #[error("engine has been shut down")]
    Closed,

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

// A block a remote peer asked us to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

// Cumulative counters reported by the engine for one torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {

    pub active_peers: usize,

    pub connected_seeders: usize,

    // Payload bytes received.
    pub bytes_read_data: u64,

    // Payload bytes sent.
    pub bytes_written_data: u64,

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {

    // Relative to the torrent's storage root.
    pub path: PathBuf,

    pub length: u64,

    pub bytes_completed: u64,

}

// Metadata, only available once the info dict has been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmInfo {

    pub name: String,

    pub length: u64,

    pub files: Vec<FileEntry>,

}

// Content built from local files, handed to the engine for seeding.
#[derive(Debug, Clone)]
pub struct LocalTorrent {

    pub info_hash: InfoHash,

    // Bencoded info dict.
    pub info_bytes: Vec<u8>,

    // Directory the file paths in the info dict are relative to.
    pub root: PathBuf,

    pub trackers: Vec<Vec<Url>>,

    pub creation_date: i64,

}

#[async_trait::async_trait]
pub trait SwarmTorrent: Send + Sync {

    fn info_hash(&self) -> InfoHash;

    // Resolves once metadata is available. Must be cancel safe.
    async fn wait_info(&self);

    fn info(&self) -> Option<SwarmInfo>;

    fn bytes_completed(&self) -> u64;

    fn stats(&self) -> TransferStats;

    fn set_download(&self, allowed: bool);

    fn set_upload(&self, allowed: bool);

    fn download_all(&self);

    // Detach from the swarm; the handle is unusable afterwards.
    fn drop_torrent(&self);

}

pub trait SwarmEngine: Send + Sync {

    fn add_magnet(&self, uri: &str) -> Result<Arc<dyn SwarmTorrent>>;

    fn add_local(&self, torrent: LocalTorrent) -> Result<Arc<dyn SwarmTorrent>>;

    // Installed before any torrent is added.
    fn set_peer_hooks(&self, hooks: Arc<dyn PeerHooks>);

    fn close(&self);

}

// One live peer-wire connection.
pub trait PeerConn: Send + Sync {

    fn address(&self) -> SocketAddr;

    // Torrent the connection belongs to, if the handshake finished.
    fn info_hash(&self) -> Option<InfoHash>;

    fn write_extended(&self, ext_id: u8, payload: Vec<u8>) -> Result<()>;

    // Let the engine serve the block request it was told to hold.
    fn release_request(&self);

}

// Callbacks the engine invokes from its peer tasks.
pub trait PeerHooks: Send + Sync {

    fn on_extended_message(&self, peer: Arc<dyn PeerConn>, ext_id: u8, payload: Bytes);

    // Returning false holds the block until `PeerConn::release_request`.
    fn approve_piece_request(&self, peer: Arc<dyn PeerConn>, block: BlockInfo) -> bool;

    fn on_peer_closed(&self, peer: &dyn PeerConn);

}
