//! Durable, atomic checkpoint persistence for one session.
//!
//! Directory layout per session:
//! ```text
//! <state_root>/<pipeline_name>/<session_id>/
//!     checkpoint.json         session state (the commit point)
//!     checkpoint.json.meta    { "checksum": "<sha256 of items file>" }
//!     items_output.json       accumulated item outputs
//! ```
//!
//! Invariant: a reader either finds no checkpoint, or a fully consistent
//! (state, output, checksum) triple. Saves write `.tmp` siblings, fsync,
//! then rename with `checkpoint.json` renamed last, so a crash at any
//! byte offset leaves the previous valid checkpoint in place.

use crate::checkpoint::SessionState;
use crate::models::EnrichedItem;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "checkpoint.json";
const META_FILE: &str = "checkpoint.json.meta";
const ITEMS_FILE: &str = "items_output.json";

/// Checkpoint persistence errors.
///
/// `Absent` and `Corrupt` are deliberately distinct variants: a fresh
/// start and damaged progress must never be confused.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoint exists for this session; callers may start fresh.
    #[error("No checkpoint found for session")]
    Absent,

    /// A checkpoint exists but fails validation. Must be surfaced to the
    /// operator; never silently discarded.
    #[error("Checkpoint is corrupt: {reason}")]
    Corrupt { reason: String },

    /// A save attempt failed. The previous valid checkpoint is intact.
    #[error("Checkpoint write failed: {context}")]
    Write {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CheckpointError {
    fn write(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Write {
            context: context.into(),
            source,
        }
    }

    fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Checksum sidecar document.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    checksum: String,
}

/// A loaded, validated checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    pub state: SessionState,
    pub items: BTreeMap<String, EnrichedItem>,
}

/// Owns the on-disk checkpoint artifacts for one session.
pub struct CheckpointManager {
    session_dir: PathBuf,
    /// Periodic save interval; zero disables `should_checkpoint`
    interval: Duration,
    /// Baseline for the interval: session start, then each save
    last_saved: Instant,
}

impl CheckpointManager {
    /// Create a manager for a session, creating its directory.
    pub fn new(
        state_root: &Path,
        pipeline_name: &str,
        session_id: &str,
        interval_mins: u64,
    ) -> Result<Self, CheckpointError> {
        let session_dir = state_root.join(pipeline_name).join(session_id);
        fs::create_dir_all(&session_dir)
            .map_err(|e| CheckpointError::write("creating session directory", e))?;

        Ok(Self {
            session_dir,
            interval: Duration::from_secs(interval_mins * 60),
            last_saved: Instant::now(),
        })
    }

    /// Session directory path.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Whether the periodic interval has elapsed since the last
    /// successful save. Always false when the interval is zero; forced
    /// saves bypass this check entirely.
    pub fn should_checkpoint(&self) -> bool {
        !self.interval.is_zero() && self.last_saved.elapsed() >= self.interval
    }

    /// Atomically persist the session state and accumulated outputs.
    ///
    /// Write failures leave the previous checkpoint untouched: nothing
    /// canonical is replaced until its replacement is fully on disk.
    pub fn save(
        &mut self,
        state: &SessionState,
        items: &BTreeMap<String, EnrichedItem>,
    ) -> Result<(), CheckpointError> {
        let items_path = self.session_dir.join(ITEMS_FILE);
        let meta_path = self.session_dir.join(META_FILE);
        let state_path = self.session_dir.join(STATE_FILE);

        let items_tmp = tmp_path(&items_path);
        let meta_tmp = tmp_path(&meta_path);
        let state_tmp = tmp_path(&state_path);

        write_json(&items_tmp, items)?;

        let checksum = sha256_file(&items_tmp)
            .map_err(|e| CheckpointError::write("hashing items output", e))?;
        write_json(&meta_tmp, &CheckpointMeta { checksum })?;
        write_json(&state_tmp, state)?;

        // Rename order matters: the state file is the commit point, so
        // its dependencies must be in place first.
        fs::rename(&items_tmp, &items_path)
            .map_err(|e| CheckpointError::write("renaming items output", e))?;
        fs::rename(&meta_tmp, &meta_path)
            .map_err(|e| CheckpointError::write("renaming checkpoint meta", e))?;
        fs::rename(&state_tmp, &state_path)
            .map_err(|e| CheckpointError::write("renaming checkpoint state", e))?;

        self.last_saved = Instant::now();
        debug!(
            session_dir = %self.session_dir.display(),
            items = items.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load and validate this session's checkpoint.
    ///
    /// Returns `Absent` when no checkpoint was ever committed, `Corrupt`
    /// when the triple is incomplete or the items checksum mismatches.
    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        // Leftovers from a crashed save are not part of the committed
        // triple; drop them before reading.
        self.remove_stale_tmp_files();

        let state_path = self.session_dir.join(STATE_FILE);
        if !state_path.exists() {
            return Err(CheckpointError::Absent);
        }

        let state: SessionState = read_json(&state_path)
            .map_err(|e| CheckpointError::corrupt(format!("unreadable state file: {e}")))?;

        let meta_path = self.session_dir.join(META_FILE);
        let meta: CheckpointMeta = read_json(&meta_path)
            .map_err(|e| CheckpointError::corrupt(format!("unreadable meta file: {e}")))?;

        let items_path = self.session_dir.join(ITEMS_FILE);
        let actual = sha256_file(&items_path)
            .map_err(|e| CheckpointError::corrupt(format!("unreadable items file: {e}")))?;

        if actual != meta.checksum {
            return Err(CheckpointError::corrupt(format!(
                "items checksum mismatch: stored {}, computed {}",
                meta.checksum, actual
            )));
        }

        let items: BTreeMap<String, EnrichedItem> = read_json(&items_path)
            .map_err(|e| CheckpointError::corrupt(format!("unparseable items file: {e}")))?;

        info!(
            session_id = %state.session_id,
            sources = state.sources.len(),
            items = items.len(),
            "Checkpoint loaded"
        );
        Ok(Checkpoint { state, items })
    }

    /// Remove all checkpoint artifacts for this session.
    pub fn cleanup(&self) -> Result<(), CheckpointError> {
        if self.session_dir.exists() {
            fs::remove_dir_all(&self.session_dir)
                .map_err(|e| CheckpointError::write("removing session directory", e))?;
            info!(session_dir = %self.session_dir.display(), "Checkpoint cleaned up");
        }
        Ok(())
    }

    /// Find the most recently modified session with a valid checkpoint
    /// under `<state_root>/<pipeline_name>/`.
    ///
    /// When several sessions exist, the newest valid one is
    /// authoritative; corrupt ones are skipped with a warning so the
    /// operator sees them.
    pub fn latest_session(
        state_root: &Path,
        pipeline_name: &str,
    ) -> Result<Option<String>, CheckpointError> {
        let pipeline_dir = state_root.join(pipeline_name);
        if !pipeline_dir.exists() {
            return Ok(None);
        }

        let entries = fs::read_dir(&pipeline_dir)
            .map_err(|e| CheckpointError::write("scanning pipeline state directory", e))?;

        let mut newest: Option<(std::time::SystemTime, String)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let session_id = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            let state_path = path.join(STATE_FILE);
            let modified = match fs::metadata(&state_path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue, // no committed checkpoint in this dir
            };

            let manager = Self {
                session_dir: path,
                interval: Duration::ZERO,
                last_saved: Instant::now(),
            };
            match manager.load() {
                Ok(_) => {
                    if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                        newest = Some((modified, session_id));
                    }
                }
                Err(CheckpointError::Absent) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Skipping invalid checkpoint");
                }
            }
        }

        Ok(newest.map(|(_, id)| id))
    }

    fn remove_stale_tmp_files(&self) {
        let pattern = self.session_dir.join("*.tmp");
        if let Ok(paths) = glob::glob(&pattern.to_string_lossy()) {
            for path in paths.flatten() {
                warn!(path = %path.display(), "Removing stale temp file from crashed save");
                let _ = fs::remove_file(&path);
            }
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize to a file and fsync it.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let file = File::create(path)
        .map_err(|e| CheckpointError::write(format!("creating {}", path.display()), e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer
        .flush()
        .map_err(|e| CheckpointError::write(format!("flushing {}", path.display()), e))?;
    writer
        .into_inner()
        .map_err(|e| CheckpointError::write(format!("flushing {}", path.display()), e.into()))?
        .sync_all()
        .map_err(|e| CheckpointError::write(format!("syncing {}", path.display()), e))?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(std::io::Error::other)
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionResult;
    use tempfile::TempDir;

    fn sample_items() -> BTreeMap<String, EnrichedItem> {
        let mut items = BTreeMap::new();
        items.insert(
            "paper-1".to_string(),
            EnrichedItem {
                item_id: "paper-1".to_string(),
                source: "arxiv".to_string(),
                low_confidence: false,
                attempts: 1,
                item_cost_usd: 0.0,
                result: ExtractionResult::ok(
                    "metadata",
                    serde_json::json!({"title": "Scaling"}),
                    0.9,
                    0.0,
                    3,
                ),
            },
        );
        items
    }

    fn manager(root: &Path) -> CheckpointManager {
        CheckpointManager::new(root, "paperpipe", "session-1", 5).unwrap()
    }

    #[test]
    fn load_without_checkpoint_is_absent() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        assert!(matches!(mgr.load(), Err(CheckpointError::Absent)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(tmp.path());
        let state = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        let items = sample_items();

        mgr.save(&state, &items).unwrap();
        let loaded = mgr.load().unwrap();
        assert_eq!(loaded.state.session_id, state.session_id);
        assert_eq!(loaded.items.len(), 1);
        assert!(loaded.items.contains_key("paper-1"));
    }

    #[test]
    fn repeated_save_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(tmp.path());
        let state = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        let items = sample_items();

        mgr.save(&state, &items).unwrap();
        let first = fs::read(mgr.session_dir().join(ITEMS_FILE)).unwrap();
        mgr.save(&state, &items).unwrap();
        let second = fs::read(mgr.session_dir().join(ITEMS_FILE)).unwrap();

        assert_eq!(first, second);
        mgr.load().unwrap();
    }

    #[test]
    fn tampered_items_file_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(tmp.path());
        let state = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        mgr.save(&state, &sample_items()).unwrap();

        // Truncate the items file behind the manager's back
        fs::write(mgr.session_dir().join(ITEMS_FILE), b"{").unwrap();

        assert!(matches!(
            mgr.load(),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn missing_meta_is_corrupt_not_absent() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(tmp.path());
        let state = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        mgr.save(&state, &sample_items()).unwrap();

        fs::remove_file(mgr.session_dir().join(META_FILE)).unwrap();

        assert!(matches!(
            mgr.load(),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn crashed_save_leaves_previous_checkpoint_loadable() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(tmp.path());
        let state = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        let items = sample_items();
        mgr.save(&state, &items).unwrap();

        // Simulate a crash mid-save: truncated temp files exist but were
        // never renamed into place.
        fs::write(mgr.session_dir().join("items_output.json.tmp"), b"{\"par").unwrap();
        fs::write(mgr.session_dir().join("checkpoint.json.tmp"), b"gar").unwrap();

        let loaded = mgr.load().unwrap();
        assert_eq!(loaded.items.len(), 1);
        // Stale temps are swept on load
        assert!(!mgr.session_dir().join("items_output.json.tmp").exists());
    }

    #[test]
    fn cleanup_removes_session_dir() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(tmp.path());
        let state = SessionState::new("paperpipe", "test", &["arxiv".to_string()]);
        mgr.save(&state, &sample_items()).unwrap();

        mgr.cleanup().unwrap();
        assert!(!mgr.session_dir().exists());
        assert!(matches!(mgr.load(), Err(CheckpointError::Absent)));
    }

    #[test]
    fn zero_interval_disables_periodic_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(tmp.path(), "paperpipe", "s", 0).unwrap();
        assert!(!mgr.should_checkpoint());
    }

    #[test]
    fn interval_elapsed_triggers_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = CheckpointManager::new(tmp.path(), "paperpipe", "s", 5).unwrap();
        assert!(!mgr.should_checkpoint());
        mgr.interval = Duration::from_millis(10);
        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.should_checkpoint());
    }

    #[test]
    fn latest_session_prefers_newest_valid() {
        let tmp = TempDir::new().unwrap();
        let state_a = SessionState::new("paperpipe", "a", &["arxiv".to_string()]);
        let state_b = SessionState::new("paperpipe", "b", &["arxiv".to_string()]);

        let mut mgr_a =
            CheckpointManager::new(tmp.path(), "paperpipe", &state_a.session_id, 5).unwrap();
        mgr_a.save(&state_a, &BTreeMap::new()).unwrap();

        std::thread::sleep(Duration::from_millis(20));

        let mut mgr_b =
            CheckpointManager::new(tmp.path(), "paperpipe", &state_b.session_id, 5).unwrap();
        mgr_b.save(&state_b, &BTreeMap::new()).unwrap();

        // Corrupt the newer session: it must be skipped, not chosen.
        fs::write(mgr_b.session_dir().join(ITEMS_FILE), b"{").unwrap();

        let latest = CheckpointManager::latest_session(tmp.path(), "paperpipe").unwrap();
        assert_eq!(latest, Some(state_a.session_id));
    }

    #[test]
    fn latest_session_none_when_empty() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            CheckpointManager::latest_session(tmp.path(), "paperpipe").unwrap(),
            None
        );
    }
}
