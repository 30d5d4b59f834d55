use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use serde_derive::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use crate::{
    broadcast::ArcBroadcaster,
    config::{Config, ConfigError},
    desktop::{Desktop, DesktopError, SystemDesktop},
    engine::{self, EngineError, SwarmEngine},
    extension::MicroPayExtension,
    registry::{Registry, RegistryError, TorrentView},
    stats::{AggregateStats, StatsAggregator},
    wallet::{FundingClient, SharedWallet, UtxoIndexer, Utxo, Wallet, WalletError},
    InfoHash, UserEvent, UserRx, UserTx,
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {

    #[error("configuration: {0}")]
    Config(String),

    #[error("failed to start the swarm engine: {0}")]
    ClientInit(#[from] EngineError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("desktop: {0}")]
    Desktop(#[from] DesktopError),

}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

impl From<ConfigError> for ClientError {
    fn from(e: ConfigError) -> Self {
        ClientError::Config(e.to_string())
    }
}

// What the engine factory needs to lay out its storage.
#[derive(Debug, Clone)]
pub struct EngineConfig {

    pub download_dir: PathBuf,

    pub pieces_dir: PathBuf,

    // Extension slot to advertise in the extended handshake.
    pub extension_id: u8,

}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WalletState {

    pub balance: u64,

    pub address: String,

}

// Brings up wallet, engine, registry, payment extension and stats task, in
// that order. Fails only when the wallet or the engine cannot be created; an
// unreachable indexer leaves the wallet offline until the next sync.
pub async fn start_client<F>(config: Config, engine_factory: F) -> Result<(Client, UserRx)>
where
    F: FnOnce(&EngineConfig) -> engine::Result<Arc<dyn SwarmEngine>>,
{
    for dir in [&config.root_dir, &config.download_dir, &config.pieces_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ClientError::Config(format!("creating {}: {}", dir.display(), e)))?;
    }

    let wallet = Wallet::load_or_create(&config.wallet_file, config.network)
        .map_err(|e| ClientError::Config(format!("wallet: {}", e)))?;
    let wallet = SharedWallet::new(
        wallet,
        UtxoIndexer::new(config.indexer_url.clone()),
        config.sync_cooldown,
    );
    tracing::info!("wallet address: {}", wallet.address());
    if let Err(e) = wallet.sync(true).await {
        tracing::warn!("initial wallet sync failed, starting offline: {}", e);
    }

    let engine = engine_factory(&EngineConfig {
        download_dir: config.download_dir.clone(),
        pieces_dir: config.pieces_dir.clone(),
        extension_id: config.extension_id,
    })?;

    let (user_tx, user_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(Registry::new(config.registry_config(), engine.clone(), user_tx.clone()));

    let broadcaster = Arc::new(ArcBroadcaster::new(config.broadcast.clone()));
    let extension = MicroPayExtension::new(&config, registry.clone(), wallet.clone(), broadcaster, user_tx.clone());
    engine.set_peer_hooks(Arc::new(extension));

    match registry.reload().await {
        Ok(n) => tracing::info!("restored {} torrents", n),
        Err(e) => tracing::error!("failed to restore torrents: {}", e),
    }

    let stats_cancel = CancellationToken::new();
    let stats_handle = StatsAggregator::new(registry.clone(), user_tx.clone(), config.stats)
        .spawn(stats_cancel.clone());

    let funding = FundingClient::new(config.funding_url.clone(), config.funding_originator.clone());
    Ok((
        Client {
            config,
            registry,
            wallet,
            engine,
            funding,
            desktop: Arc::new(SystemDesktop),
            user_tx,
            stats_cancel,
            stats_handle,
        },
        user_rx,
    ))
}

// Handle the UI drives the client through.
pub struct Client {

    config: Config,

    registry: Arc<Registry>,

    wallet: SharedWallet,

    engine: Arc<dyn SwarmEngine>,

    funding: FundingClient,

    desktop: Arc<dyn Desktop>,

    user_tx: UserTx,

    stats_cancel: CancellationToken,

    stats_handle: JoinHandle<()>,

}

impl Client {

    pub fn set_desktop(&mut self, desktop: Arc<dyn Desktop>) {
        self.desktop = desktop;
    }

    pub async fn add_magnet(&self, uri: &str) -> Result<InfoHash> {
        Ok(self.registry.add_magnet(uri).await?)
    }

    // Returns the magnet link of the created content.
    pub async fn create_from_path(&self, path: &Path) -> Result<String> {
        Ok(self.registry.create_from_path(path).await?)
    }

    pub async fn list_torrents(&self) -> Vec<TorrentView> {
        self.registry.list().await
    }

    pub async fn get_torrent(&self, id: &str) -> Result<TorrentView> {
        let id: InfoHash = id.parse().map_err(RegistryError::from)?;
        Ok(self.registry.get(&id).await?)
    }

    pub async fn pause(&self, id: &InfoHash) -> Result<()> {
        Ok(self.registry.pause(id).await?)
    }

    pub async fn resume(&self, id: &InfoHash) -> Result<()> {
        Ok(self.registry.resume(id).await?)
    }

    pub async fn remove(&self, id: &InfoHash, delete_files: bool) -> Result<()> {
        Ok(self.registry.remove(id, delete_files).await?)
    }

    pub async fn stats(&self) -> AggregateStats {
        self.registry.aggregate().await
    }

    pub async fn wallet_state(&self) -> WalletState {
        WalletState {
            balance: self.wallet.balance().await,
            address: self.wallet.address().to_string(),
        }
    }

    // Bypasses the cooldown.
    pub async fn sync_wallet(&self) -> Result<WalletState> {
        self.wallet.sync(true).await?;
        self.user_tx.send(UserEvent::WalletUpdated).ok();
        Ok(self.wallet_state().await)
    }

    // Tops up the client wallet from the user's wallet. The new output is
    // spendable right away, before the indexer has seen it.
    #[tracing::instrument(skip(self))]
    pub async fn request_funds(&self, amount: u64) -> Result<Utxo> {
        let utxo = self.funding.request_funds(self.wallet.locking_script(), amount).await?;
        self.wallet.lock().await.add_utxo(utxo.clone());
        self.user_tx.send(UserEvent::WalletUpdated).ok();
        Ok(utxo)
    }

    pub fn open_download_folder(&self) -> Result<()> {
        Ok(self.desktop.open_folder(&self.config.download_dir)?)
    }

    pub fn select_seed_path(&self) -> Result<Option<PathBuf>> {
        Ok(self.desktop.pick_directory()?)
    }

    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.registry.persist().await;
        self.stats_cancel.cancel();
        if let Err(e) = self.stats_handle.await {
            tracing::error!("stats task failed: {}", e);
        }
        self.engine.close();
    }
}
