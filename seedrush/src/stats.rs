use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use serde_derive::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::{config::StatsConfig, registry::{Registry, TorrentView}, UserEvent, UserTx};

const DATA_UNIT: u64 = 1024;

// Byte rate derived from a cumulative counter, one per session per direction.
#[derive(Debug, Clone, Copy)]
pub struct SpeedTracker {

    last_time: Instant,

    last_bytes: u64,

    // Bytes per second over the last sample window.
    speed: u64,

}

impl SpeedTracker {

    pub fn new(now: Instant) -> Self {
        Self { last_time: now, last_bytes: 0, speed: 0 }
    }

    // Takes the counter's current value. A counter that went backwards is
    // treated as restarted.
    pub fn sample(&mut self, bytes: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_time).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.speed = (bytes.saturating_sub(self.last_bytes) as f64 / elapsed) as u64;
        self.last_bytes = bytes;
        self.last_time = now;
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        SpeedTracker::new(Instant::now())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputTrackers {

    pub down: SpeedTracker,

    pub up: SpeedTracker,

}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {

    pub download_rate: u64,

    pub upload_rate: u64,

    pub total_download: String,

    pub total_upload: String,

    // Not paused and not yet complete.
    pub active_torrents: usize,

    pub total_peers: usize,

}

// What the UI receives on every refresh.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Snapshot {

    pub torrents: Vec<TorrentView>,

    pub stats: AggregateStats,

}

pub fn format_bytes(bytes: u64) -> String {
    if bytes < DATA_UNIT {
        return format!("{} B", bytes);
    }

    let (mut div, mut exp) = (DATA_UNIT, 0);
    let mut n = bytes / DATA_UNIT;
    while n >= DATA_UNIT {
        div *= DATA_UNIT;
        exp += 1;
        n /= DATA_UNIT;
    }

    format!("{:.1} {}B", bytes as f64 / div as f64, "KMGTPE".as_bytes()[exp] as char)
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format_bytes(bytes_per_sec) + "/s"
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs / 60) % 60)
    }
}

// Periodic task: resamples throughput, publishes a snapshot when it changed
// and flushes ledger updates to disk.
pub struct StatsAggregator {

    registry: Arc<Registry>,

    user_tx: UserTx,

    config: StatsConfig,

    // Serialized form of the last published snapshot and when it went out.
    last_published: Option<(String, Instant)>,

}

impl StatsAggregator {

    pub fn new(registry: Arc<Registry>, user_tx: UserTx, config: StatsConfig) -> Self {
        Self { registry, user_tx, config, last_published: None }
    }

    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => { self.tick().await; }
                }
            }
            tracing::debug!("stats task stopped");
        })
    }

    // One round. Returns whether a snapshot was published.
    pub async fn tick(&mut self) -> bool {
        self.registry.sample_speeds().await;
        let snapshot = Snapshot {
            torrents: self.registry.list().await,
            stats: self.registry.aggregate().await,
        };
        let published = self.publish(snapshot);
        self.registry.persist_if_dirty().await;
        published
    }

    fn publish(&mut self, snapshot: Snapshot) -> bool {
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("failed to serialize snapshot: {}", e);
                return false;
            }
        };

        let now = Instant::now();
        if let Some((last, at)) = &self.last_published {
            if *last == json && now.duration_since(*at) < self.config.staleness {
                return false;
            }
        }

        self.user_tx.send(UserEvent::TorrentsUpdated(Some(Box::new(snapshot)))).ok();
        self.last_published = Some((json, now));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_sampling() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new(start);

        tracker.sample(2048, start + Duration::from_secs(2));
        assert_eq!(tracker.speed(), 1024);

        tracker.sample(2048 + 500, start + Duration::from_millis(2500));
        assert_eq!(tracker.speed(), 1000);

        // Same instant, nothing to divide by.
        tracker.sample(10_000, start + Duration::from_millis(2500));
        assert_eq!(tracker.speed(), 1000);

        // Counter restarted by the engine.
        tracker.sample(0, start + Duration::from_secs(3));
        assert_eq!(tracker.speed(), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
        assert_eq!(format_speed(2048), "2.0 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(150)), "2m");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 25 * 60)), "3h 25m");
    }
}
