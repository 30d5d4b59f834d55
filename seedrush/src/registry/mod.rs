//! Torrent sessions, their payment ledgers and the state file behind them.
//!
//! Sessions, paused flags and ledgers change together under one write lock.
//! Throughput trackers sit behind their own lock, always taken after the
//! session lock. Neither is held across engine waits or network calls.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use crate::{
    config::RegistryConfig,
    descriptor::{Descriptor, DescriptorError, MagnetLink},
    engine::{self, EngineError, LocalTorrent, SwarmEngine, SwarmTorrent},
    stats::{format_speed, AggregateStats, ThroughputTrackers},
    InfoHash, InvalidInfoHash, UserEvent, UserTx,
};

mod status;
mod store;
mod view;

pub use status::TorrentStatus;
pub use store::{PersistedTorrent, PersistenceError, StateStore};
pub use view::{FileView, TorrentView};

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {

    #[error("torrent not found: {0}")]
    NotFound(InfoHash),

    #[error(transparent)]
    InvalidId(#[from] InvalidInfoHash),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("torrent already added: {0}")]
    AlreadyAdded(InfoHash),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

}

// Satoshis moved on behalf of one torrent. Only ever grows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ledger {

    pub earned: u64,

    pub spent: u64,

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {

    // Downloaded into the download directory.
    Magnet,

    // Seeded in place from the user's files.
    Local(PathBuf),

}

struct Session {

    handle: Arc<dyn SwarmTorrent>,

    magnet: String,

    origin: Origin,

    paused: bool,

    ledger: Ledger,

    updated_at: DateTime<Utc>,

    // Tells this registration apart from a later one under the same hash.
    generation: u64,

    metadata_wait: MetadataWait,

}

// Background wait for a session's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetadataWait {

    // No waiter running: metadata arrived, or the session was restored paused.
    Idle,

    // Within the metadata timeout.
    Pending,

    // Past the timeout, transfer allowed, still waiting without a deadline.
    Overdue,

}

// Initial state of a session being registered.
struct SessionInit {
    magnet: String,
    origin: Origin,
    paused: bool,
    ledger: Ledger,
    updated_at: DateTime<Utc>,
}

impl SessionInit {
    fn fresh(magnet: String, origin: Origin) -> Self {
        Self { magnet, origin, paused: false, ledger: Ledger::default(), updated_at: Utc::now() }
    }
}

pub struct Registry {

    config: RegistryConfig,

    engine: Arc<dyn SwarmEngine>,

    user_tx: UserTx,

    store: StateStore,

    sessions: RwLock<HashMap<InfoHash, Session>>,

    speeds: RwLock<HashMap<InfoHash, ThroughputTrackers>>,

    next_generation: AtomicU64,

    // Ledger changes not yet on disk.
    dirty: AtomicBool,

}

impl Registry {

    pub fn new(config: RegistryConfig, engine: Arc<dyn SwarmEngine>, user_tx: UserTx) -> Self {
        Self {
            store: StateStore::new(config.state_file.clone()),
            config,
            engine,
            user_tx,
            sessions: RwLock::new(HashMap::new()),
            speeds: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn add_magnet(self: &Arc<Self>, uri: &str) -> Result<InfoHash> {
        let uri = uri.trim();
        let magnet = MagnetLink::parse(uri).map_err(|e| RegistryError::InvalidDescriptor(e.to_string()))?;

        let (id, generation, handle) = self
            .register(magnet.info_hash, SessionInit::fresh(uri.to_string(), Origin::Magnet), |engine| {
                engine.add_magnet(uri)
            })
            .await?;
        tracing::info!("added torrent {}", id);

        self.persist().await;
        self.user_tx.send(UserEvent::TorrentAdded(id)).ok();
        self.spawn_metadata_wait(id, generation, handle);
        Ok(id)
    }

    // Hashes local content, seeds it and returns its magnet link.
    #[tracing::instrument(skip(self))]
    pub async fn create_from_path(self: &Arc<Self>, path: &Path) -> Result<String> {
        let descriptor = self.build_descriptor(path.to_path_buf()).await?;
        let magnet = descriptor.magnet();

        let init = SessionInit::fresh(magnet.clone(), Origin::Local(path.to_path_buf()));
        let (id, generation, handle) = self.register_local(descriptor, init).await?;
        tracing::info!("seeding {} from {}", id, path.display());

        self.persist().await;
        self.user_tx.send(UserEvent::TorrentAdded(id)).ok();
        if !self.activate(id, generation, &handle).await {
            self.spawn_late_wait(id, generation, handle);
        }
        Ok(magnet)
    }

    pub async fn pause(&self, id: &InfoHash) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
            session.handle.set_download(false);
            session.handle.set_upload(false);
            session.paused = true;
            session.updated_at = Utc::now();
        }
        tracing::info!("paused {}", id);

        self.persist().await;
        self.user_tx.send(UserEvent::TorrentUpdated(*id)).ok();
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, id: &InfoHash) -> Result<()> {
        let rearm = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
            session.paused = false;
            session.updated_at = Utc::now();
            if session.handle.info().is_some() {
                session.handle.set_download(true);
                session.handle.set_upload(true);
                session.handle.download_all();
                None
            } else {
                match session.metadata_wait {
                    // The running waiter starts the transfer.
                    MetadataWait::Pending => None,
                    MetadataWait::Overdue => {
                        session.handle.set_download(true);
                        session.handle.set_upload(true);
                        None
                    }
                    MetadataWait::Idle => {
                        session.metadata_wait = MetadataWait::Pending;
                        Some((session.generation, session.handle.clone()))
                    }
                }
            }
        };
        if let Some((generation, handle)) = rearm {
            self.spawn_metadata_wait(*id, generation, handle);
        }
        tracing::info!("resumed {}", id);

        self.persist().await;
        self.user_tx.send(UserEvent::TorrentUpdated(*id)).ok();
        Ok(())
    }

    // Local seeds never have their files deleted.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: &InfoHash, delete_files: bool) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.remove(id).ok_or(RegistryError::NotFound(*id))?;
            self.speeds.write().await.remove(id);
            session
        };

        session.handle.set_download(false);
        session.handle.set_upload(false);
        let info = session.handle.info();
        session.handle.drop_torrent();
        tracing::info!("removed {}", id);

        if delete_files {
            match (&session.origin, info) {
                (Origin::Magnet, Some(info)) => self.delete_download(&info.name).await,
                (Origin::Magnet, None) => tracing::debug!("{} has no metadata, nothing to delete", id),
                (Origin::Local(path), _) => tracing::info!("keeping seeded files at {}", path.display()),
            }
        }

        self.persist().await;
        self.user_tx.send(UserEvent::TorrentsUpdated(None)).ok();
        Ok(())
    }

    // Full projection of the registry as written to the state file.
    pub async fn snapshot(&self) -> Vec<PersistedTorrent> {
        let sessions = self.sessions.read().await;
        let mut torrents: Vec<_> = sessions
            .iter()
            .map(|(id, s)| PersistedTorrent {
                info_hash: *id,
                magnet_uri: Some(s.magnet.clone()),
                seed_path: match &s.origin {
                    Origin::Local(path) => Some(path.clone()),
                    Origin::Magnet => None,
                },
                is_paused: s.paused,
                satoshis_earned: s.ledger.earned,
                satoshis_spent: s.ledger.spent,
                updated_at: s.updated_at,
            })
            .collect();
        torrents.sort_by(|a, b| a.info_hash.cmp(&b.info_hash));
        torrents
    }

    // Failures are logged, the next mutation or stats tick tries again.
    pub async fn persist(&self) {
        if let Err(e) = self.try_persist().await {
            tracing::warn!("failed to write {}: {}", self.store.path().display(), e);
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub async fn try_persist(&self) -> Result<()> {
        let _guard = self.store.lock().await;
        self.dirty.store(false, Ordering::SeqCst);
        let mut snapshot = self.snapshot().await;
        self.store.write(&mut snapshot).await?;
        Ok(())
    }

    pub async fn persist_if_dirty(&self) {
        if self.dirty.load(Ordering::SeqCst) {
            self.persist().await;
        }
    }

    // Re-registers everything in the state file. Returns how many sessions
    // came back; entries that fail are logged and skipped.
    pub async fn reload(self: &Arc<Self>) -> Result<usize> {
        let entries = self.store.load().await?;
        let mut restored = 0;
        for entry in entries {
            let id = entry.info_hash;
            match self.restore(entry).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!("skipping saved torrent {}: {}", id, e),
            }
        }
        tracing::info!("restored {} torrents", restored);
        self.user_tx.send(UserEvent::TorrentsUpdated(None)).ok();
        Ok(restored)
    }

    async fn restore(self: &Arc<Self>, entry: PersistedTorrent) -> Result<()> {
        let ledger = Ledger { earned: entry.satoshis_earned, spent: entry.satoshis_spent };
        let paused = entry.is_paused;

        let (id, generation, handle) = match (entry.seed_path, entry.magnet_uri) {
            (Some(path), _) => {
                let descriptor = self.build_descriptor(path.clone()).await?;
                let init = SessionInit {
                    magnet: descriptor.magnet(),
                    origin: Origin::Local(path),
                    paused,
                    ledger,
                    updated_at: entry.updated_at,
                };
                self.register_local(descriptor, init).await?
            }
            (None, Some(uri)) => {
                let magnet = MagnetLink::parse(&uri).map_err(|e| RegistryError::InvalidDescriptor(e.to_string()))?;
                let init = SessionInit { magnet: uri.clone(), origin: Origin::Magnet, paused, ledger, updated_at: entry.updated_at };
                self.register(magnet.info_hash, init, |engine| engine.add_magnet(&uri)).await?
            }
            (None, None) => return Err(RegistryError::InvalidDescriptor("no magnet link or seed path".into())),
        };

        if id != entry.info_hash {
            tracing::warn!("saved torrent {} came back as {}", entry.info_hash, id);
        }
        if !paused {
            self.spawn_metadata_wait(id, generation, handle);
        }
        Ok(())
    }

    pub async fn record_earned(&self, id: &InfoHash, amount: u64) -> Result<Ledger> {
        self.update_ledger(id, |ledger| ledger.earned = ledger.earned.saturating_add(amount)).await
    }

    pub async fn record_spent(&self, id: &InfoHash, amount: u64) -> Result<Ledger> {
        self.update_ledger(id, |ledger| ledger.spent = ledger.spent.saturating_add(amount)).await
    }

    async fn update_ledger(&self, id: &InfoHash, f: impl FnOnce(&mut Ledger)) -> Result<Ledger> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        f(&mut session.ledger);
        session.updated_at = Utc::now();
        self.dirty.store(true, Ordering::SeqCst);
        Ok(session.ledger)
    }

    pub async fn ledger(&self, id: &InfoHash) -> Result<Ledger> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|s| s.ledger).ok_or(RegistryError::NotFound(*id))
    }

    pub async fn list(&self) -> Vec<TorrentView> {
        let sessions = self.sessions.read().await;
        let speeds = self.speeds.read().await;
        let mut views: Vec<_> = sessions
            .iter()
            .map(|(id, session)| Self::view(*id, session, speeds.get(id)))
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        views
    }

    pub async fn get(&self, id: &InfoHash) -> Result<TorrentView> {
        let sessions = self.sessions.read().await;
        let speeds = self.speeds.read().await;
        let session = sessions.get(id).ok_or(RegistryError::NotFound(*id))?;
        Ok(Self::view(*id, session, speeds.get(id)))
    }

    pub async fn aggregate(&self) -> AggregateStats {
        let sessions = self.sessions.read().await;
        let speeds = self.speeds.read().await;

        let mut stats = AggregateStats::default();
        for (id, session) in sessions.iter() {
            if let Some(trackers) = speeds.get(id) {
                stats.download_rate += trackers.down.speed();
                stats.upload_rate += trackers.up.speed();
            }
            let total_len = session.handle.info().map_or(0, |info| info.length);
            if !session.paused && session.handle.bytes_completed() < total_len {
                stats.active_torrents += 1;
            }
            stats.total_peers += session.handle.stats().active_peers;
        }
        stats.total_download = format_speed(stats.download_rate);
        stats.total_upload = format_speed(stats.upload_rate);
        stats
    }

    // Feeds the engine's cumulative counters into the throughput trackers.
    pub async fn sample_speeds(&self) {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let mut speeds = self.speeds.write().await;
        for (id, session) in sessions.iter() {
            let stats = session.handle.stats();
            let trackers = speeds.entry(*id).or_default();
            trackers.down.sample(stats.bytes_read_data, now);
            trackers.up.sample(stats.bytes_written_data, now);
        }
    }

    fn view(id: InfoHash, session: &Session, trackers: Option<&ThroughputTrackers>) -> TorrentView {
        TorrentView::build(view::ViewSource {
            id,
            magnet: &session.magnet,
            paused: session.paused,
            ledger: session.ledger,
            updated_at: session.updated_at,
            info: session.handle.info(),
            bytes_completed: session.handle.bytes_completed(),
            stats: session.handle.stats(),
            download_speed: trackers.map_or(0, |t| t.down.speed()),
            upload_speed: trackers.map_or(0, |t| t.up.speed()),
        })
    }

    // Inserts a session, adding it to the engine under the same write lock so
    // a hash is never registered twice.
    async fn register<F>(
        &self,
        known_id: Option<InfoHash>,
        init: SessionInit,
        add: F,
    ) -> Result<(InfoHash, u64, Arc<dyn SwarmTorrent>)>
    where
        F: FnOnce(&dyn SwarmEngine) -> engine::Result<Arc<dyn SwarmTorrent>>,
    {
        let mut sessions = self.sessions.write().await;
        if let Some(id) = known_id {
            if sessions.contains_key(&id) {
                return Err(RegistryError::AlreadyAdded(id));
            }
        }

        let handle = add(self.engine.as_ref())?;
        let id = handle.info_hash();
        if sessions.contains_key(&id) {
            return Err(RegistryError::AlreadyAdded(id));
        }
        if init.paused {
            handle.set_download(false);
            handle.set_upload(false);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        sessions.insert(id, Session {
            handle: handle.clone(),
            magnet: init.magnet,
            origin: init.origin,
            paused: init.paused,
            ledger: init.ledger,
            updated_at: init.updated_at,
            generation,
            // Paused sessions get their waiter on resume.
            metadata_wait: if init.paused { MetadataWait::Idle } else { MetadataWait::Pending },
        });
        self.speeds.write().await.insert(id, ThroughputTrackers::default());
        Ok((id, generation, handle))
    }

    async fn register_local(
        &self,
        descriptor: Descriptor,
        init: SessionInit,
    ) -> Result<(InfoHash, u64, Arc<dyn SwarmTorrent>)> {
        let local = LocalTorrent {
            info_hash: descriptor.info_hash,
            info_bytes: descriptor.info_bytes,
            root: descriptor.root,
            trackers: descriptor.trackers,
            creation_date: descriptor.creation_date,
        };
        self.register(Some(local.info_hash), init, move |engine| engine.add_local(local)).await
    }

    // Hashing reads every byte of the content, so it runs off the runtime.
    async fn build_descriptor(&self, path: PathBuf) -> Result<Descriptor> {
        let piece_length = self.config.piece_length;
        let trackers = self.config.announce_list.clone();
        let descriptor = tokio::task::spawn_blocking(move || {
            Descriptor::build(&path, piece_length, trackers)
        })
        .await??;
        Ok(descriptor)
    }

    // Waits for metadata in the background, then starts the transfer.
    fn spawn_metadata_wait(self: &Arc<Self>, id: InfoHash, generation: u64, handle: Arc<dyn SwarmTorrent>) {
        let registry = self.clone();
        tokio::spawn(async move {
            if !registry.activate(id, generation, &handle).await {
                registry.spawn_late_wait(id, generation, handle);
            }
        });
    }

    // Waits up to the metadata timeout. On timeout the transfer is enabled
    // anyway and false is returned.
    async fn activate(&self, id: InfoHash, generation: u64, handle: &Arc<dyn SwarmTorrent>) -> bool {
        let timeout = self.config.metadata_timeout;
        let ready = tokio::time::timeout(timeout, handle.wait_info()).await.is_ok();
        if !ready {
            tracing::warn!("no metadata for {} after {:?}, starting transfer anyway", id, timeout);
        }

        if self.start_transfer(id, generation, ready).await {
            if ready {
                tracing::info!("metadata ready for {}", id);
                self.persist().await;
            }
            self.user_tx.send(UserEvent::TorrentUpdated(id)).ok();
        }
        ready
    }

    // Keeps waiting without a deadline. Holds only a weak reference so a
    // session that never gets metadata does not keep the registry alive.
    fn spawn_late_wait(self: &Arc<Self>, id: InfoHash, generation: u64, handle: Arc<dyn SwarmTorrent>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            handle.wait_info().await;
            let Some(registry) = registry.upgrade() else { return };
            if registry.start_transfer(id, generation, true).await {
                tracing::info!("metadata finally ready for {}", id);
                registry.persist().await;
                registry.user_tx.send(UserEvent::TorrentUpdated(id)).ok();
            }
        });
    }

    // No-op when the session was removed, replaced or paused meanwhile.
    // `download_all` means metadata arrived, otherwise the wait timed out.
    async fn start_transfer(&self, id: InfoHash, generation: u64, download_all: bool) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.generation == generation => {
                session.metadata_wait = if download_all { MetadataWait::Idle } else { MetadataWait::Overdue };
                if session.paused {
                    return false;
                }
                session.handle.set_download(true);
                session.handle.set_upload(true);
                if download_all {
                    session.handle.download_all();
                }
                true
            }
            _ => false,
        }
    }

    async fn delete_download(&self, name: &str) {
        let mut components = Path::new(name).components();
        let single = matches!((components.next(), components.next()), (Some(Component::Normal(_)), None));
        if !single {
            tracing::warn!("refusing to delete {:?} outside the download directory", name);
            return;
        }

        let path = self.config.download_dir.join(name);
        let result = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::info!("deleted {}", path.display()),
            Err(e) => tracing::warn!("failed to delete {}: {}", path.display(), e),
        }
    }
}
