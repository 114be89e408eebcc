//! File-backed run store.
//!
//! Layout under the state directory:
//!
//! ```text
//! run/<run_id>/checkpoint.json
//! run/<run_id>/definition.json
//! run/<run_id>/work_items/<item_id>.json
//! run/<run_id>/gates/<phase_id>.json      append-only array
//! run/<run_id>/decisions/<decision_id>.json
//! run/<run_id>/attempts.jsonl
//! run/<run_id>/abort                      out-of-process abort request
//! archive/<run_id>-<timestamp>/           archived runs
//! ```
//!
//! Every write goes to a temp file and is renamed into place. Read-modify-write
//! sequences hold an exclusive advisory lock on a per-key lock file.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::{
    AttemptLog, CheckpointStore, DecisionStore, GateStore, RunStore, WorkItemStore, apply_cas,
    apply_checkpoint, sorted,
};
use crate::audit::AttemptRecord;
use crate::decision::DecisionRecord;
use crate::errors::StoreError;
use crate::gates::GateResult;
use crate::orchestrator::state::{RunState, RunStatus};
use crate::phase::{RunDefinition, validate_id};
use crate::work_item::{WorkItem, WorkItemStatus};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const DEFINITION_FILE: &str = "definition.json";
const ATTEMPTS_FILE: &str = "attempts.jsonl";
const ABORT_FILE: &str = "abort";
const ITEMS_DIR: &str = "work_items";
const GATES_DIR: &str = "gates";
const DECISIONS_DIR: &str = "decisions";
const LOCKS_DIR: &str = ".locks";

/// One line of `waypoint list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub definition_name: String,
    pub status: RunStatus,
    pub current_phase_id: Option<String>,
    pub budget_consumed: u64,
    pub last_checkpoint_at: DateTime<Utc>,
}

pub struct FileStore {
    run_id: String,
    root: PathBuf,
}

/// Held for the duration of a read-modify-write; the lock drops with the file.
struct KeyLock {
    _file: File,
}

impl FileStore {
    pub fn run_dir(state_dir: &Path, run_id: &str) -> PathBuf {
        state_dir.join("run").join(run_id)
    }

    pub fn exists(state_dir: &Path, run_id: &str) -> bool {
        Self::run_dir(state_dir, run_id).is_dir()
    }

    /// Run directory for an id that is safe to use as a single path segment.
    fn checked_run_dir(state_dir: &Path, run_id: &str) -> Result<PathBuf, StoreError> {
        validate_id(run_id).map_err(|_| StoreError::InvalidRunId(run_id.to_string()))?;
        Ok(Self::run_dir(state_dir, run_id))
    }

    /// Create the directory tree for a new run.
    pub fn create(state_dir: &Path, run_id: &str) -> Result<Self, StoreError> {
        let root = Self::checked_run_dir(state_dir, run_id)?;
        for dir in [ITEMS_DIR, GATES_DIR, DECISIONS_DIR, LOCKS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(Self {
            run_id: run_id.to_string(),
            root,
        })
    }

    /// Open an existing run.
    pub fn open(state_dir: &Path, run_id: &str) -> Result<Self, StoreError> {
        if !Self::checked_run_dir(state_dir, run_id)?.is_dir() {
            return Err(StoreError::NotFound {
                kind: "Run",
                id: run_id.to_string(),
            });
        }
        Self::create(state_dir, run_id)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Summaries of every run under `state_dir` that has a checkpoint, newest first.
    pub fn list_runs(state_dir: &Path) -> Result<Vec<RunSummary>, StoreError> {
        let runs_dir = state_dir.join("run");
        if !runs_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&runs_dir).map_err(|e| StoreError::io(&runs_dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&runs_dir, e))?;
            let checkpoint = entry.path().join(CHECKPOINT_FILE);
            if let Some(state) = read_json::<RunState>(&checkpoint)? {
                runs.push(RunSummary {
                    run_id: state.run_id,
                    definition_name: state.definition_name,
                    status: state.status,
                    current_phase_id: state.current_phase_id,
                    budget_consumed: state.budget_consumed,
                    last_checkpoint_at: state.last_checkpoint_at,
                });
            }
        }
        runs.sort_by(|a, b| b.last_checkpoint_at.cmp(&a.last_checkpoint_at));
        Ok(runs)
    }

    /// Move a run out of the live tree. Returns the archive location.
    pub fn archive_run(state_dir: &Path, run_id: &str) -> Result<PathBuf, StoreError> {
        let source = Self::checked_run_dir(state_dir, run_id)?;
        if !source.is_dir() {
            return Err(StoreError::NotFound {
                kind: "Run",
                id: run_id.to_string(),
            });
        }
        let archive_dir = state_dir.join("archive");
        fs::create_dir_all(&archive_dir).map_err(|e| StoreError::io(&archive_dir, e))?;
        let target = archive_dir.join(format!(
            "{}-{}",
            run_id,
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        fs::rename(&source, &target).map_err(|e| StoreError::io(&source, e))?;
        Ok(target)
    }

    fn item_path(&self, id: &str) -> PathBuf {
        self.root.join(ITEMS_DIR).join(format!("{}.json", id))
    }

    fn gate_path(&self, phase_id: &str) -> PathBuf {
        self.root.join(GATES_DIR).join(format!("{}.json", phase_id))
    }

    fn decision_path(&self, id: &str) -> PathBuf {
        self.root.join(DECISIONS_DIR).join(format!("{}.json", id))
    }

    fn lock(&self, key: &str) -> Result<KeyLock, StoreError> {
        let path = self.root.join(LOCKS_DIR).join(format!("{}.lock", key));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(&path, e))?;
        Ok(KeyLock { _file: file })
    }

    fn read_dir_json<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>, StoreError> {
        let dir = self.root.join(dir);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(value) = read_json(&path)?
            {
                out.push(value);
            }
        }
        Ok(out)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::serde(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Write `value` as pretty JSON via temp file and rename.
///
/// The temp file is synced before the rename and the directory after it, so a
/// crash leaves either the old record or the new one, never a torn file.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value).map_err(|e| StoreError::serde(path, e))?;
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(content.as_bytes())?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })?;
    sync_parent(path)
}

/// Persist the directory entry created by a rename.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

impl WorkItemStore for FileStore {
    fn put(&self, item: &WorkItem) -> Result<(), StoreError> {
        let _lock = self.lock(&format!("item-{}", item.id))?;
        let path = self.item_path(&item.id);
        if let Some(existing) = read_json::<WorkItem>(&path)?
            && existing.status.is_immutable()
        {
            return Err(StoreError::Immutable {
                id: item.id.clone(),
                status: existing.status,
            });
        }
        write_json_atomic(&path, item)
    }

    fn insert_if_absent(&self, item: &WorkItem) -> Result<bool, StoreError> {
        let _lock = self.lock(&format!("item-{}", item.id))?;
        let path = self.item_path(&item.id);
        if path.exists() {
            return Ok(false);
        }
        write_json_atomic(&path, item)?;
        Ok(true)
    }

    fn get(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
        read_json(&self.item_path(id))
    }

    fn list_by_phase(
        &self,
        phase_id: &str,
        status: Option<WorkItemStatus>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self
            .read_dir_json::<WorkItem>(ITEMS_DIR)?
            .into_iter()
            .filter(|i| i.phase_id == phase_id && status.is_none_or(|s| i.status == s))
            .collect();
        Ok(sorted(items))
    }

    fn list_all(&self) -> Result<Vec<WorkItem>, StoreError> {
        Ok(sorted(self.read_dir_json(ITEMS_DIR)?))
    }

    fn compare_and_update(
        &self,
        id: &str,
        expected: WorkItemStatus,
        mutate: &mut dyn FnMut(&mut WorkItem),
    ) -> Result<WorkItem, StoreError> {
        let _lock = self.lock(&format!("item-{}", id))?;
        let path = self.item_path(id);
        let current = read_json::<WorkItem>(&path)?.ok_or_else(|| StoreError::NotFound {
            kind: "Work item",
            id: id.to_string(),
        })?;
        let next = apply_cas(&current, expected, mutate)?;
        write_json_atomic(&path, &next)?;
        debug!(item = id, from = %current.status, to = %next.status, "work item updated");
        Ok(next)
    }
}

impl CheckpointStore for FileStore {
    fn load_checkpoint(&self) -> Result<Option<RunState>, StoreError> {
        read_json(&self.root.join(CHECKPOINT_FILE))
    }

    fn save_checkpoint(&self, state: &RunState, expected_seq: u64) -> Result<RunState, StoreError> {
        let _lock = self.lock("checkpoint")?;
        let path = self.root.join(CHECKPOINT_FILE);
        let current = read_json::<RunState>(&path)?;
        let next = apply_checkpoint(current.as_ref(), state, expected_seq)?;
        write_json_atomic(&path, &next)?;
        debug!(run_id = %self.run_id, seq = next.seq, status = %next.status, "checkpoint written");
        Ok(next)
    }
}

impl GateStore for FileStore {
    fn append_gate_result(&self, result: &GateResult) -> Result<(), StoreError> {
        let _lock = self.lock(&format!("gate-{}", result.phase_id))?;
        let path = self.gate_path(&result.phase_id);
        let mut history: Vec<GateResult> = read_json(&path)?.unwrap_or_default();
        history.push(result.clone());
        write_json_atomic(&path, &history)
    }

    fn gate_history(&self, phase_id: &str) -> Result<Vec<GateResult>, StoreError> {
        Ok(read_json(&self.gate_path(phase_id))?.unwrap_or_default())
    }
}

impl DecisionStore for FileStore {
    fn put_decision(&self, decision: &DecisionRecord) -> Result<(), StoreError> {
        let _lock = self.lock(&format!("decision-{}", decision.id))?;
        write_json_atomic(&self.decision_path(&decision.id), decision)
    }

    fn get_decision(&self, id: &str) -> Result<Option<DecisionRecord>, StoreError> {
        read_json(&self.decision_path(id))
    }

    fn list_decisions(&self) -> Result<Vec<DecisionRecord>, StoreError> {
        let mut decisions: Vec<DecisionRecord> = self.read_dir_json(DECISIONS_DIR)?;
        decisions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(decisions)
    }
}

impl AttemptLog for FileStore {
    fn append_attempt(&self, record: &AttemptRecord) -> Result<(), StoreError> {
        let _lock = self.lock("attempts")?;
        let path = self.root.join(ATTEMPTS_FILE);
        let mut line = serde_json::to_string(record).map_err(|e| StoreError::serde(&path, e))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| StoreError::io(&path, e))
    }

    fn attempts(&self) -> Result<Vec<AttemptRecord>, StoreError> {
        let path = self.root.join(ATTEMPTS_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line).map_err(|e| StoreError::serde(&path, e))?);
        }
        Ok(records)
    }
}

impl RunStore for FileStore {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn save_definition(&self, definition: &RunDefinition) -> Result<(), StoreError> {
        write_json_atomic(&self.root.join(DEFINITION_FILE), definition)
    }

    fn load_definition(&self) -> Result<Option<RunDefinition>, StoreError> {
        read_json(&self.root.join(DEFINITION_FILE))
    }

    fn abort_requested(&self) -> Result<bool, StoreError> {
        Ok(self.root.join(ABORT_FILE).exists())
    }

    fn request_abort(&self) -> Result<(), StoreError> {
        let path = self.root.join(ABORT_FILE);
        fs::write(&path, Utc::now().to_rfc3339()).map_err(|e| StoreError::io(&path, e))
    }
}
