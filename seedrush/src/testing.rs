// Test doubles: an in-memory swarm engine, a recording peer connection and a
// scripted HTTP server for the relay, indexer and funding endpoints.

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, sync::watch};
use url::Url;
use crate::{
    engine::*,
    wallet::{SharedWallet, Utxo, UtxoIndexer, Wallet},
    InfoHash, MagnetLink, UserEvent, UserRx,
};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct MockServer {
    pub url: Url,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {

    // Every request is answered by `respond` with (status, json body).
    pub async fn start<F>(respond: F) -> MockServer
    where
        F: Fn(&RecordedRequest) -> (u16, String) + Send + Sync + 'static,
    {
        MockServer::start_delayed(Duration::ZERO, respond).await
    }

    // Like `start`, but every answer is held back for `delay`.
    pub async fn start_delayed<F>(delay: Duration, respond: F) -> MockServer
    where
        F: Fn(&RecordedRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let respond = respond.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let respond = respond.clone();
                        let recorded = recorded.clone();
                        async move {
                            let method = req.method().to_string();
                            let path = req.uri().to_string();
                            let headers = req
                                .headers()
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                                .collect();
                            let body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|b| b.to_bytes().to_vec())
                                .unwrap_or_default();
                            let request = RecordedRequest { method, path, headers, body };
                            tokio::time::sleep(delay).await;
                            let (status, body) = respond(&request);
                            recorded.lock().unwrap().push(request);
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "application/json")
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockServer { url, requests }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

pub fn fake_txid(n: u64) -> String {
    format!("{:064x}", n)
}

pub fn funded_wallet(amounts: &[u64]) -> Wallet {
    let mut wallet = Wallet::create(bitcoin::Network::Bitcoin).unwrap();
    wallet.set_utxos(
        amounts
            .iter()
            .enumerate()
            .map(|(i, &satoshis)| Utxo { vout: 0, satoshis, txid: fake_txid(i as u64 + 1) })
            .collect(),
    );
    wallet
}

// Indexer pointing nowhere; for tests that never sync.
pub fn shared_wallet(wallet: Wallet) -> SharedWallet {
    SharedWallet::new(
        wallet,
        UtxoIndexer::new(Url::parse("http://127.0.0.1:9").unwrap()),
        Duration::from_secs(300),
    )
}

pub fn drain_events(rx: &mut UserRx) -> Vec<UserEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub struct MockTorrent {
    pub info_hash: InfoHash,
    info: Mutex<Option<SwarmInfo>>,
    ready: watch::Sender<bool>,
    pub bytes_completed: AtomicU64,
    stats: Mutex<TransferStats>,
    pub download: AtomicBool,
    pub upload: AtomicBool,
    pub downloading_all: AtomicBool,
    pub dropped: AtomicBool,
}

impl MockTorrent {

    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            info: Mutex::new(None),
            ready: watch::channel(false).0,
            bytes_completed: AtomicU64::new(0),
            stats: Mutex::new(TransferStats::default()),
            download: AtomicBool::new(false),
            upload: AtomicBool::new(false),
            downloading_all: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn set_info(&self, info: SwarmInfo) {
        *self.info.lock().unwrap() = Some(info);
        self.ready.send_replace(true);
    }

    pub fn set_stats(&self, stats: TransferStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn transfer_allowed(&self) -> bool {
        self.download.load(Ordering::SeqCst) && self.upload.load(Ordering::SeqCst)
    }
}

pub fn sample_info(name: &str, length: u64) -> SwarmInfo {
    SwarmInfo {
        name: name.to_string(),
        length,
        files: vec![FileEntry {
            path: name.into(),
            length,
            bytes_completed: 0,
        }],
    }
}

#[async_trait::async_trait]
impl SwarmTorrent for MockTorrent {

    fn info_hash(&self) -> InfoHash { self.info_hash }

    async fn wait_info(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn info(&self) -> Option<SwarmInfo> { self.info.lock().unwrap().clone() }

    fn bytes_completed(&self) -> u64 { self.bytes_completed.load(Ordering::SeqCst) }

    fn stats(&self) -> TransferStats { *self.stats.lock().unwrap() }

    fn set_download(&self, allowed: bool) { self.download.store(allowed, Ordering::SeqCst) }

    fn set_upload(&self, allowed: bool) { self.upload.store(allowed, Ordering::SeqCst) }

    fn download_all(&self) { self.downloading_all.store(true, Ordering::SeqCst) }

    fn drop_torrent(&self) { self.dropped.store(true, Ordering::SeqCst) }
}

#[derive(Default)]
pub struct MockEngine {
    torrents: Mutex<HashMap<InfoHash, Arc<MockTorrent>>>,
    hooks: Mutex<Option<Arc<dyn PeerHooks>>>,
    // Metadata handed to magnet torrents as soon as they are added.
    pub instant_info: Mutex<Option<SwarmInfo>>,
    pub reject: AtomicBool,
    pub closed: AtomicBool,
    pub added: AtomicUsize,
}

impl MockEngine {

    pub fn with_instant_info(info: SwarmInfo) -> Self {
        let engine = MockEngine::default();
        *engine.instant_info.lock().unwrap() = Some(info);
        engine
    }

    pub fn torrent(&self, id: &InfoHash) -> Arc<MockTorrent> {
        self.torrents.lock().unwrap().get(id).cloned().expect("torrent registered")
    }

    pub fn hooks(&self) -> Option<Arc<dyn PeerHooks>> {
        self.hooks.lock().unwrap().clone()
    }
}

impl SwarmEngine for MockEngine {

    fn add_magnet(&self, uri: &str) -> Result<Arc<dyn SwarmTorrent>> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("mock engine rejects".into()));
        }
        let magnet = MagnetLink::parse(uri).map_err(|e| EngineError::InvalidMagnet(e.to_string()))?;
        let id = magnet.info_hash.ok_or_else(|| EngineError::InvalidMagnet(uri.into()))?;

        let torrent = self
            .torrents
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(MockTorrent::new(id)))
            .clone();
        if let Some(info) = self.instant_info.lock().unwrap().clone() {
            torrent.set_info(info);
        }
        self.added.fetch_add(1, Ordering::SeqCst);
        Ok(torrent)
    }

    fn add_local(&self, local: LocalTorrent) -> Result<Arc<dyn SwarmTorrent>> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("mock engine rejects".into()));
        }
        let torrent = Arc::new(MockTorrent::new(local.info_hash));
        torrent.set_info(sample_info("local", 6));
        torrent.bytes_completed.store(6, Ordering::SeqCst);
        self.torrents.lock().unwrap().insert(local.info_hash, torrent.clone());
        self.added.fetch_add(1, Ordering::SeqCst);
        Ok(torrent)
    }

    fn set_peer_hooks(&self, hooks: Arc<dyn PeerHooks>) {
        *self.hooks.lock().unwrap() = Some(hooks);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockPeer {
    pub address: SocketAddr,
    pub info_hash: Option<InfoHash>,
    pub sent: Mutex<Vec<(u8, Vec<u8>)>>,
    pub released: AtomicUsize,
    pub fail_writes: AtomicBool,
}

impl MockPeer {

    pub fn new(port: u16, info_hash: Option<InfoHash>) -> Arc<MockPeer> {
        Arc::new(MockPeer {
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            info_hash,
            sent: Mutex::new(Vec::new()),
            released: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<(u8, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl PeerConn for MockPeer {

    fn address(&self) -> SocketAddr { self.address }

    fn info_hash(&self) -> Option<InfoHash> { self.info_hash }

    fn write_extended(&self, ext_id: u8, payload: Vec<u8>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::PeerClosed);
        }
        self.sent.lock().unwrap().push((ext_id, payload));
        Ok(())
    }

    fn release_request(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
