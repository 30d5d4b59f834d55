use serde_derive::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TorrentStatus {
    Paused,
    Loading,
    Seeding,
    Downloading,
    Stalled,
}

impl TorrentStatus {

    // First match wins: paused, then missing metadata, then completion, then peers.
    pub fn derive(paused: bool, total_len: Option<u64>, bytes_completed: u64, active_peers: usize) -> Self {
        if paused {
            return TorrentStatus::Paused;
        }
        let total_len = match total_len {
            Some(len) if len > 0 => len,
            _ => return TorrentStatus::Loading,
        };
        if bytes_completed >= total_len {
            TorrentStatus::Seeding
        } else if active_peers > 0 {
            TorrentStatus::Downloading
        } else {
            TorrentStatus::Stalled
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TorrentStatus::Paused => "paused",
            TorrentStatus::Loading => "loading",
            TorrentStatus::Seeding => "seeding",
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::Stalled => "stalled",
        }
    }
}

impl std::fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
