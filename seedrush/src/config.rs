use std::{ffi::OsString, path::PathBuf, time::Duration};
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {

    #[error("no home directory found, set HOME or SEEDRUSH_HOME")]
    NoHomeDir,

}

#[derive(Debug, Clone)]
pub struct Config {

    // Everything the client writes lives under this directory.
    pub root_dir: PathBuf,

    pub download_dir: PathBuf,

    // Piece completion database for locally seeded content.
    pub pieces_dir: PathBuf,

    pub state_file: PathBuf,

    // WIF encoded signing key.
    pub wallet_file: PathBuf,

    pub network: bitcoin::Network,

    // Extension slot the micropayment messages travel on.
    pub extension_id: u8,

    // Satoshis paid per served piece request.
    pub piece_price: u64,

    pub fees: FeePolicy,

    pub indexer_url: Url,

    pub sync_cooldown: Duration,

    pub broadcast: BroadcastConfig,

    // External user wallet used to top up the client wallet.
    pub funding_url: Url,

    pub funding_originator: String,

    pub registry: RegistryConfig,

    pub stats: StatsConfig,

}

// Flat fee model: per_input * inputs + base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {

    pub per_input: u64,

    pub base: u64,

}

impl FeePolicy {
    pub fn fee(&self, num_inputs: usize) -> u64 {
        self.per_input * num_inputs as u64 + self.base
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {

    pub url: Url,

    pub token: Option<String>,

    // Relay status to wait for before answering.
    pub wait_for: String,

    // Retries after the first attempt.
    pub max_retries: u32,

    pub retry_interval: Duration,

}

#[derive(Debug, Clone)]
pub struct RegistryConfig {

    pub download_dir: PathBuf,

    pub state_file: PathBuf,

    pub metadata_timeout: Duration,

    pub piece_length: u32,

    // Tiers of trackers attached to content we create.
    pub announce_list: Vec<Vec<Url>>,

}

#[derive(Debug, Clone, Copy)]
pub struct StatsConfig {

    pub interval: Duration,

    // Publish even an unchanged snapshot once it is this old.
    pub staleness: Duration,

}

const DEFAULT_PIECE_PRICE: u64 = 100;
const DEFAULT_EXTENSION_ID: u8 = 10;
const DEFAULT_PIECE_LENGTH: u32 = 64 * 1024;
const DEFAULT_INDEXER_URL: &str = "https://api.bitails.io";
const DEFAULT_ARC_URL: &str = "https://arc.taal.com/v1";
const DEFAULT_FUNDING_URL: &str = "http://localhost:3321";
const DEFAULT_ORIGINATOR: &str = "https://seedrush.online";

const BUILTIN_ANNOUNCE_LIST: [&str; 5] = [
    "wss://tracker.btorrent.xyz",
    "wss://tracker.openwebtorrent.com",
    "http://p4p.arenabg.com:1337/announce",
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
];

impl Config {

    pub fn with_root(root_dir: PathBuf) -> Self {
        Self {
            download_dir: root_dir.join("downloads"),
            pieces_dir: root_dir.join("pieces"),
            state_file: root_dir.join("torrents.json"),
            wallet_file: root_dir.join("wif.txt"),
            root_dir,
            network: bitcoin::Network::Bitcoin,
            extension_id: DEFAULT_EXTENSION_ID,
            piece_price: DEFAULT_PIECE_PRICE,
            fees: FeePolicy { per_input: 20, base: 10 },
            indexer_url: parse_builtin(DEFAULT_INDEXER_URL),
            sync_cooldown: Duration::from_secs(5 * 60),
            broadcast: BroadcastConfig {
                url: parse_builtin(DEFAULT_ARC_URL),
                token: None,
                wait_for: "ACCEPTED_BY_NETWORK".to_string(),
                max_retries: 50,
                retry_interval: Duration::from_secs(1),
            },
            funding_url: parse_builtin(DEFAULT_FUNDING_URL),
            funding_originator: DEFAULT_ORIGINATOR.to_string(),
            registry: RegistryConfig {
                download_dir: PathBuf::new(),
                state_file: PathBuf::new(),
                metadata_timeout: Duration::from_secs(120),
                piece_length: DEFAULT_PIECE_LENGTH,
                announce_list: BUILTIN_ANNOUNCE_LIST
                    .iter()
                    .map(|url| vec![parse_builtin(url)])
                    .collect(),
            },
            stats: StatsConfig {
                interval: Duration::from_secs(1),
                staleness: Duration::from_secs(5),
            },
        }
    }

    // Defaults overridden by SEEDRUSH_HOME, SEEDRUSH_ARC_TOKEN and SEEDRUSH_INDEXER_URL.
    // Without SEEDRUSH_HOME the root sits in the user's home directory, and
    // not finding one is fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_vars(|key| std::env::var_os(key))
    }

    fn from_vars(var: impl Fn(&str) -> Option<OsString>) -> Result<Self, ConfigError> {
        let root = match var("SEEDRUSH_HOME").filter(|root| !root.is_empty()) {
            Some(root) => PathBuf::from(root),
            None => var("HOME")
                .filter(|home| !home.is_empty())
                .or_else(|| var("USERPROFILE").filter(|home| !home.is_empty()))
                .map(|home| PathBuf::from(home).join("seedrush"))
                .ok_or(ConfigError::NoHomeDir)?,
        };

        let mut config = Config::with_root(root);
        if let Some(token) = var("SEEDRUSH_ARC_TOKEN") {
            config.broadcast.token = Some(token.to_string_lossy().into_owned());
        }
        if let Some(url) = var("SEEDRUSH_INDEXER_URL") {
            let url = url.to_string_lossy();
            match Url::parse(&url) {
                Ok(url) => config.indexer_url = url,
                Err(e) => tracing::warn!("ignoring SEEDRUSH_INDEXER_URL {}: {}", url, e),
            }
        }
        Ok(config)
    }

    // Registry settings with the directory layout filled in.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            download_dir: self.download_dir.clone(),
            state_file: self.state_file.clone(),
            ..self.registry.clone()
        }
    }
}

// Only used for the constants above, which are known to parse.
fn parse_builtin(url: &str) -> Url {
    Url::parse(url).expect("builtin url")
}
