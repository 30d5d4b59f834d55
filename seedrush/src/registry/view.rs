use std::time::Duration;
use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use crate::{
    engine::{SwarmInfo, TransferStats},
    stats::{format_bytes, format_duration, format_speed},
    InfoHash,
};
use super::{Ledger, TorrentStatus};

// Session as presented to the UI.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TorrentView {

    pub id: InfoHash,

    pub info_hash: InfoHash,

    pub name: String,

    pub status: TorrentStatus,

    pub is_paused: bool,

    pub peers: usize,

    pub seeds: usize,

    pub size: u64,

    pub size_str: String,

    // Percent, 0 to 100.
    pub progress: f64,

    pub download_speed: u64,

    pub upload_speed: u64,

    pub download_speed_str: String,

    pub upload_speed_str: String,

    pub eta: String,

    pub satoshis_earned: u64,

    pub satoshis_spent: u64,

    pub magnet_uri: String,

    pub updated_at: DateTime<Utc>,

    pub files: Vec<FileView>,

}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileView {

    pub name: String,

    pub path: String,

    pub size: u64,

    pub size_str: String,

    pub progress: f64,

}

// Everything a view is computed from, gathered under the registry lock.
pub(super) struct ViewSource<'a> {
    pub id: InfoHash,
    pub magnet: &'a str,
    pub paused: bool,
    pub ledger: Ledger,
    pub updated_at: DateTime<Utc>,
    pub info: Option<SwarmInfo>,
    pub bytes_completed: u64,
    pub stats: TransferStats,
    pub download_speed: u64,
    pub upload_speed: u64,
}

impl TorrentView {

    pub(super) fn build(src: ViewSource<'_>) -> Self {
        let total_len = src.info.as_ref().map(|i| i.length);
        let size = total_len.unwrap_or(0);
        let status = TorrentStatus::derive(src.paused, total_len, src.bytes_completed, src.stats.active_peers);

        let eta = if src.download_speed > 0 && src.bytes_completed < size {
            format_duration(Duration::from_secs((size - src.bytes_completed) / src.download_speed))
        } else {
            "Unknown".to_string()
        };

        let (name, files) = match src.info {
            Some(info) => {
                let files = info
                    .files
                    .iter()
                    .map(|f| FileView {
                        name: f
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        path: f.path.to_string_lossy().into_owned(),
                        size: f.length,
                        size_str: format_bytes(f.length),
                        progress: percent(f.bytes_completed, f.length),
                    })
                    .collect();
                (info.name, files)
            }
            None => (src.id.to_string(), Vec::new()),
        };

        TorrentView {
            id: src.id,
            info_hash: src.id,
            name,
            status,
            is_paused: src.paused,
            peers: src.stats.active_peers,
            seeds: src.stats.connected_seeders,
            size,
            size_str: format_bytes(size),
            progress: percent(src.bytes_completed, size),
            download_speed: src.download_speed,
            upload_speed: src.upload_speed,
            download_speed_str: format_speed(src.download_speed),
            upload_speed_str: format_speed(src.upload_speed),
            eta,
            satoshis_earned: src.ledger.earned,
            satoshis_spent: src.ledger.spent,
            magnet_uri: src.magnet.to_string(),
            updated_at: src.updated_at,
            files,
        }
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (done.min(total) as f64 / total as f64) * 100.0
}
