use std::{fmt, str::FromStr};
use tokio::sync::mpsc;

mod config;
mod client;
mod descriptor;
mod desktop;
pub mod engine;
pub mod wallet;
pub mod broadcast;
pub mod extension;
pub mod registry;
pub mod stats;

#[cfg(test)]
mod testing;

// 20 byte SHA1 info hash, shown and persisted as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid info hash: {0}")]
pub struct InvalidInfoHash(pub String);

impl FromStr for InfoHash {
    type Err = InvalidInfoHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; 20];
        hex::decode_to_slice(s.trim(), &mut id).map_err(|_| InvalidInfoHash(s.to_string()))?;
        Ok(InfoHash(id))
    }
}

impl serde::Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for InfoHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// Events the UI layer subscribes to, delivered fire-and-forget.
#[derive(Debug)]
pub enum UserEvent {

    // Periodic refresh, carries the latest snapshot when the stats task produced one.
    TorrentsUpdated(Option<Box<stats::Snapshot>>),

    // A session was registered and is waiting for metadata.
    TorrentAdded(InfoHash),

    // A session changed state (metadata arrived, transfer started).
    TorrentUpdated(InfoHash),

    // Balance or UTXO set changed.
    WalletUpdated,
}

impl UserEvent {
    // Name of the event on the UI bridge.
    pub fn name(&self) -> &'static str {
        match self {
            UserEvent::TorrentsUpdated(_) => "torrents-updated",
            UserEvent::TorrentAdded(_) => "torrent-added",
            UserEvent::TorrentUpdated(_) => "torrent-updated",
            UserEvent::WalletUpdated => "wallet-updated",
        }
    }
}

pub type UserTx = mpsc::UnboundedSender<UserEvent>;
pub type UserRx = mpsc::UnboundedReceiver<UserEvent>;

// Re-exports
pub use config::{BroadcastConfig, Config, ConfigError, FeePolicy, RegistryConfig, StatsConfig};
pub use client::{start_client, Client, ClientError, EngineConfig, Result, WalletState};
pub use descriptor::{Descriptor, DescriptorError, MagnetLink};
pub use desktop::{Desktop, DesktopError, SystemDesktop};
pub use registry::{Registry, RegistryError, TorrentStatus};

// Installs a fmt subscriber for binaries embedding the client.
pub fn init_logging(level: tracing::Level) {
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .event_format(tracing_subscriber::fmt::format())
        .finish();
    if tracing::subscriber::set_global_default(sub).is_err() {
        tracing::warn!("global tracing subscriber already set");
    }
}
