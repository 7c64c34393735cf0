//! file storage implementation using std::fs
//!
//! stores raft state in a directory with:
//! - meta.json: term and voted_for
//! - log.json: array of retained log entries
//! - config.json: latest committed membership
//! - snapshot.json: latest snapshot

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use raft_core::{ClusterConfig, LogEntry, NodeId, Snapshot, Storage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// file-based storage implementation
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// atomic write: write to temp file, fsync, then rename over the target
    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let temp_path = self.path(&format!("{name}.tmp"));
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.path(name))?;
        debug!(file = name, bytes = json.len(), "state file written");
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> io::Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn rewrite_log(&self, log: &[LogEntry]) -> io::Result<()> {
        self.write_json(LOG_FILE, log)
    }
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";
const CONFIG_FILE: &str = "config.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: u64,
    voted_for: Option<NodeId>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ConfigRecord {
    index: u64,
    config: ClusterConfig,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        self.write_json(META_FILE, &MetaData { term, voted_for })
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<NodeId>)> {
        // default for new nodes
        let meta: MetaData = self.read_json(META_FILE)?.unwrap_or_default();
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut log = self.load_log()?;
        log.extend(entries.iter().cloned());

        // write entire log (simple approach - could optimize with append-only file)
        self.rewrite_log(&log)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.read_json(LOG_FILE)?.unwrap_or_default())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        let mut log = self.load_log()?;
        log.retain(|e| e.index < from_index);
        self.rewrite_log(&log)
    }

    fn purge_log_through(&mut self, index: u64) -> io::Result<()> {
        let mut log = self.load_log()?;
        log.retain(|e| e.index > index);
        self.rewrite_log(&log)
    }

    fn save_config(&mut self, index: u64, config: &ClusterConfig) -> io::Result<()> {
        self.write_json(CONFIG_FILE, &ConfigRecord { index, config: config.clone() })
    }

    fn load_config(&self) -> io::Result<Option<(u64, ClusterConfig)>> {
        let record: Option<ConfigRecord> = self.read_json(CONFIG_FILE)?;
        Ok(record.map(|r| (r.index, r.config)))
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.write_json(SNAPSHOT_FILE, snapshot)
    }

    fn load_snapshot(&self) -> io::Result<Option<Snapshot>> {
        self.read_json(SNAPSHOT_FILE)
    }
}
