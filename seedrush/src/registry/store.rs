use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use crate::InfoHash;

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

}

type Result<T> = std::result::Result<T, PersistenceError>;

// One entry of the state file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTorrent {

    pub info_hash: InfoHash,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnet_uri: Option<String>,

    // Set for content we seed from local files; rebuilt on reload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_path: Option<PathBuf>,

    #[serde(default)]
    pub is_paused: bool,

    #[serde(default)]
    pub satoshis_earned: u64,

    #[serde(default, alias = "satoshisSpend")]
    pub satoshis_spent: u64,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

}

// The state file. Written whole, through a temp file, one writer at a time.
pub struct StateStore {

    path: PathBuf,

    write_lock: Mutex<()>,

}

impl StateStore {

    pub fn new(path: PathBuf) -> Self {
        Self { path, write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Held across snapshot and write so the newest snapshot lands last.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    // A missing or empty file is an empty state.
    pub async fn load(&self) -> Result<Vec<PersistedTorrent>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn write(&self, torrents: &mut [PersistedTorrent]) -> Result<()> {
        torrents.sort_by(|a, b| a.info_hash.cmp(&b.info_hash));
        let data = serde_json::to_vec_pretty(&torrents)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!("wrote {} torrents to {}", torrents.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> PersistedTorrent {
        PersistedTorrent {
            info_hash: InfoHash([byte; 20]),
            magnet_uri: Some(format!("magnet:?xt=urn:btih:{}", hex::encode([byte; 20]))),
            seed_path: None,
            is_paused: byte % 2 == 0,
            satoshis_earned: byte as u64 * 100,
            satoshis_spent: 300,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_sorted_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state").join("torrents.json"));

        let mut torrents = vec![entry(0xcc), entry(0x01), entry(0x7f)];
        store.write(&mut torrents).await.unwrap();

        let loaded = store.load().await.unwrap();
        let order: Vec<_> = loaded.iter().map(|t| t.info_hash.0[0]).collect();
        assert_eq!(order, vec![0x01, 0x7f, 0xcc]);
        assert_eq!(loaded, torrents);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("torrents.json"));
        assert!(store.load().await.unwrap().is_empty());

        std::fs::write(store.path(), "\n").unwrap();
        assert!(store.load().await.unwrap().is_empty());

        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load().await, Err(PersistenceError::Json(_))));
    }

    #[test]
    fn test_legacy_fields() {
        let json = r#"[{
            "isPaused": true,
            "satoshisSpend": 1200,
            "satoshisEarned": 400,
            "infoHash": "d2474e86c95b19b8bcfdb92bc12c9d44667cfa36",
            "magnetUri": "magnet:?xt=urn:btih:d2474e86c95b19b8bcfdb92bc12c9d44667cfa36",
            "updatedAt": "2025-03-04T10:11:12.123456789+01:00"
        }]"#;
        let entries: Vec<PersistedTorrent> = serde_json::from_str(json).unwrap();
        assert_eq!(entries[0].satoshis_spent, 1200);
        assert_eq!(entries[0].satoshis_earned, 400);
        assert!(entries[0].is_paused);
        assert_eq!(entries[0].seed_path, None);
        assert_eq!(entries[0].updated_at.to_rfc3339(), "2025-03-04T09:11:12.123456789+00:00");

        let out = serde_json::to_value(&entries[0]).unwrap();
        assert_eq!(out["satoshisSpent"], 1200);
        assert!(out.get("seedPath").is_none());
    }
}
