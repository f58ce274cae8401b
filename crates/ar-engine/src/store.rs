//! Durable run storage.
//!
//! A run is persisted as an append-only sequence of [`RunRecord`]s: one header,
//! then a full trial record after every trial transition and a status record
//! after every run status change. Replaying the sequence reconstructs the
//! [`RunState`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ar_optimizer::ParetoFrontier;
use ar_types::{ArResult, ConfigSpace, PersistenceError, RunError, Trial};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::run::{RunFailure, RunId, RunState, RunStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum RunRecord {
    Header {
        run_id: RunId,
        name: String,
        config_space: ConfigSpace,
        budget: usize,
        created_at: DateTime<Utc>,
    },
    Trial {
        trial: Trial,
    },
    Status {
        status: RunStatus,
        failure: Option<RunFailure>,
        at: DateTime<Utc>,
    },
}

impl RunRecord {
    pub fn header(state: &RunState) -> Self {
        Self::Header {
            run_id: state.run_id,
            name: state.name.clone(),
            config_space: state.config_space.clone(),
            budget: state.budget,
            created_at: state.created_at,
        }
    }

    pub fn trial(trial: &Trial) -> Self {
        Self::Trial {
            trial: trial.clone(),
        }
    }

    pub fn status(state: &RunState) -> Self {
        Self::Status {
            status: state.status,
            failure: state.failure.clone(),
            at: Utc::now(),
        }
    }
}

/// Rebuild a run from its record sequence. Later trial records replace
/// earlier ones with the same id.
pub fn replay(
    source: &str,
    records: impl IntoIterator<Item = RunRecord>,
) -> Result<RunState, PersistenceError> {
    let mut records = records.into_iter();
    let mut state = match records.next() {
        Some(RunRecord::Header {
            run_id,
            name,
            config_space,
            budget,
            created_at,
        }) => RunState {
            run_id,
            created_at,
            ..RunState::new(name, config_space, budget)
        },
        _ => {
            return Err(PersistenceError::MissingHeader {
                path: source.to_string(),
            })
        }
    };

    let mut index: HashMap<ar_types::TrialId, usize> = HashMap::new();
    for record in records {
        match record {
            RunRecord::Header { .. } => {
                return Err(PersistenceError::Corrupt {
                    path: source.to_string(),
                    line: 0,
                    message: "duplicate header record".to_string(),
                })
            }
            RunRecord::Trial { trial } => match index.get(&trial.id) {
                Some(&i) => state.trials[i] = trial,
                None => {
                    index.insert(trial.id, state.trials.len());
                    state.trials.push(trial);
                }
            },
            RunRecord::Status {
                status,
                failure,
                at,
            } => {
                if status == RunStatus::Running && state.started_at.is_none() {
                    state.started_at = Some(at);
                }
                state.finished_at = if status.is_terminal() { Some(at) } else { None };
                state.status = status;
                state.failure = failure;
            }
        }
    }
    state.frontier = ParetoFrontier::from_trials(&state.trials);
    Ok(state)
}

/// Append-only persistence for run records.
pub trait RunStore: Send + Sync {
    /// Durably append one record. Must not return before the record is
    /// persisted.
    fn append(&self, run_id: RunId, record: &RunRecord) -> Result<(), PersistenceError>;

    /// All records of a run in append order. Fails with
    /// [`RunError::NotFound`] for unknown runs.
    fn records(&self, run_id: RunId) -> ArResult<Vec<RunRecord>>;

    fn load(&self, run_id: RunId) -> ArResult<RunState> {
        let records = self.records(run_id)?;
        Ok(replay(&run_id.to_string(), records)?)
    }
}

/// Volatile store, used for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<RunId, Vec<RunRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.lock().keys().copied().collect()
    }
}

impl RunStore for MemoryStore {
    fn append(&self, run_id: RunId, record: &RunRecord) -> Result<(), PersistenceError> {
        self.runs
            .lock()
            .entry(run_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn records(&self, run_id: RunId) -> ArResult<Vec<RunRecord>> {
        self.runs.lock().get(&run_id).cloned().ok_or_else(|| {
            RunError::NotFound {
                run_id: run_id.to_string(),
            }
            .into()
        })
    }
}

/// One JSON-lines journal per run under a directory: `<dir>/<run_id>.jsonl`.
///
/// Every append is flushed and synced before returning. A trailing line that
/// fails to parse is treated as a torn write from a crash: reads skip it and
/// the next append truncates it away before writing.
#[derive(Debug)]
pub struct JournalStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JournalStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }

    /// Ids of every journal in the directory, sorted.
    pub fn run_ids(&self) -> ArResult<Vec<RunId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Make sure the journal ends on a line boundary. A complete record missing
    /// only its newline is terminated; a partial record is cut off.
    fn repair_tail(path: &Path, file: &mut File) -> Result<(), PersistenceError> {
        let len = file.metadata().map_err(|e| Self::write_failed(path, e))?.len();
        if len == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| Self::write_failed(path, e))?;
        if last[0] == b'\n' {
            return Ok(());
        }

        let content = fs::read(path).map_err(|e| Self::write_failed(path, e))?;
        let start = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1);
        if serde_json::from_slice::<RunRecord>(&content[start..]).is_ok() {
            file.write_all(b"\n").map_err(|e| Self::write_failed(path, e))?;
        } else {
            warn!(
                path = %path.display(),
                bytes = content.len() - start,
                "truncating torn journal line"
            );
            file.set_len(start as u64)
                .map_err(|e| Self::write_failed(path, e))?;
        }
        Ok(())
    }

    fn write_failed(path: &Path, err: impl std::fmt::Display) -> PersistenceError {
        PersistenceError::WriteFailed {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

impl RunStore for JournalStore {
    fn append(&self, run_id: RunId, record: &RunRecord) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock();
        let path = self.path(run_id);

        fs::create_dir_all(&self.dir).map_err(|e| Self::write_failed(&path, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| Self::write_failed(&path, e))?;
        Self::repair_tail(&path, &mut file)?;

        let line = serde_json::to_string(record).map_err(|e| Self::write_failed(&path, e))?;
        writeln!(file, "{line}").map_err(|e| Self::write_failed(&path, e))?;
        file.flush().map_err(|e| Self::write_failed(&path, e))?;
        file.sync_data().map_err(|e| Self::write_failed(&path, e))?;
        Ok(())
    }

    fn records(&self, run_id: RunId) -> ArResult<Vec<RunRecord>> {
        let path = self.path(run_id);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RunError::NotFound {
                    run_id: run_id.to_string(),
                }
                .into())
            }
            Err(e) => {
                return Err(PersistenceError::ReadFailed {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
                .into())
            }
        };

        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| PersistenceError::ReadFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            lines.push(line);
        }
        let last = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut records = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) if Some(i) == last => {
                    warn!(path = %path.display(), line = i + 1, error = %e, "skipping torn journal line");
                }
                Err(e) => {
                    return Err(PersistenceError::Corrupt {
                        path: path.display().to_string(),
                        line: i + 1,
                        message: e.to_string(),
                    }
                    .into())
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_types::{ArError, ConfigSpace, Dimension, EvaluationError, ObjectiveVector, TrialStatus};
    use rust_decimal_macros::dec;

    fn space() -> ConfigSpace {
        ConfigSpace::new(vec![
            Dimension::categorical("retriever", ["A", "B", "C"]),
            Dimension::integer("top_k", 1, 5),
            Dimension::continuous("temperature", 0.0, 1.0),
        ])
        .unwrap()
    }

    /// Header, a succeeded trial, a failed trial and a trial left running.
    fn write_history(store: &dyn RunStore) -> RunState {
        let mut state = RunState::new("journal", space(), 6);
        store.append(state.run_id, &RunRecord::header(&state)).unwrap();
        state.status = RunStatus::Running;
        store.append(state.run_id, &RunRecord::status(&state)).unwrap();

        let config = space()
            .configuration([
                ("retriever", ar_types::ParamValue::from("B")),
                ("top_k", 3_i64.into()),
                ("temperature", 0.3_f64.into()),
            ])
            .unwrap();

        let mut ok = Trial::new(0, 0, config.clone());
        store.append(state.run_id, &RunRecord::trial(&ok)).unwrap();
        ok.mark_running().unwrap();
        store.append(state.run_id, &RunRecord::trial(&ok)).unwrap();
        ok.mark_succeeded(ObjectiveVector::new(0.8, dec!(0.012), 1.4).unwrap(), 1)
            .unwrap();
        store.append(state.run_id, &RunRecord::trial(&ok)).unwrap();

        let mut failed = Trial::new(1, 0, config.clone());
        failed.mark_running().unwrap();
        failed
            .mark_failed(&EvaluationError::RateLimited { message: "429".into() }, 3)
            .unwrap();
        store.append(state.run_id, &RunRecord::trial(&failed)).unwrap();

        let mut running = Trial::new(2, 1, config);
        running.mark_running().unwrap();
        store.append(state.run_id, &RunRecord::trial(&running)).unwrap();

        state.trials = vec![ok, failed, running];
        state
    }

    #[test]
    fn journal_replays_latest_trial_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let written = write_history(&store);

        let loaded = store.load(written.run_id).unwrap();
        assert_eq!(loaded.run_id, written.run_id);
        assert_eq!(loaded.name, "journal");
        assert_eq!(loaded.budget, 6);
        assert_eq!(loaded.config_space, space());
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.started_at.is_some());
        assert_eq!(loaded.trials, written.trials);
        assert_eq!(loaded.trials[0].status, TrialStatus::Succeeded);
        assert_eq!(loaded.frontier.len(), 1);
        assert!(loaded.frontier.contains(written.trials[0].id));
        assert_eq!(store.run_ids().unwrap(), vec![written.run_id]);
    }

    #[test]
    fn torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let written = write_history(&store);

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.path(written.run_id))
            .unwrap();
        write!(file, "{{\"record\":\"trial\",\"trial\":{{\"id\":").unwrap();

        let loaded = store.load(written.run_id).unwrap();
        assert_eq!(loaded.trials.len(), 3);
    }

    #[test]
    fn appending_after_torn_line_keeps_journal_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let written = write_history(&store);
        let path = store.path(written.run_id);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"record\":\"tri").unwrap();
        drop(file);

        let mut state = store.load(written.run_id).unwrap();
        state.status = RunStatus::Cancelled;
        store.append(state.run_id, &RunRecord::status(&state)).unwrap();
        store.append(state.run_id, &RunRecord::status(&state)).unwrap();

        let reloaded = store.load(written.run_id).unwrap();
        assert_eq!(reloaded.status, RunStatus::Cancelled);
        assert_eq!(reloaded.trials, written.trials);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        for line in content.lines() {
            serde_json::from_str::<RunRecord>(line).unwrap();
        }
    }

    #[test]
    fn complete_record_without_newline_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let mut written = write_history(&store);
        let path = store.path(written.run_id);

        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.trim_end_matches('\n')).unwrap();

        written.status = RunStatus::Completed;
        store.append(written.run_id, &RunRecord::status(&written)).unwrap();

        let loaded = store.load(written.run_id).unwrap();
        assert_eq!(loaded.trials, written.trials);
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 8);
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let written = write_history(&store);

        let path = store.path(written.run_id);
        let content = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = content.lines().collect();
        lines.insert(2, "not json");
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let err = store.load(written.run_id).unwrap_err();
        assert!(
            matches!(err, ArError::Persistence(PersistenceError::Corrupt { line: 3, .. })),
            "{err}"
        );
    }

    #[test]
    fn unknown_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        let err = store.load(uuid::Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ArError::Run(RunError::NotFound { .. })));
        assert!(store.run_ids().unwrap().is_empty());
    }

    #[test]
    fn replay_requires_header_first() {
        let trial = Trial::new(0, 0, ar_types::Configuration::from_values([("top_k", 1_i64)]));
        let err = replay("mem", vec![RunRecord::trial(&trial)]).unwrap_err();
        assert!(matches!(err, PersistenceError::MissingHeader { .. }));
    }

    #[test]
    fn memory_store_matches_journal() {
        let store = MemoryStore::new();
        let written = write_history(&store);
        let loaded = store.load(written.run_id).unwrap();
        assert_eq!(loaded.trials, written.trials);
        assert_eq!(store.run_ids(), vec![written.run_id]);
    }

    #[test]
    fn terminal_status_sets_finish_time() {
        let store = MemoryStore::new();
        let mut state = write_history(&store);
        state.status = RunStatus::Failed;
        state.failure = Some(RunFailure {
            kind: crate::run::RunFailureKind::TooManyFailures,
            message: "too many".into(),
        });
        store.append(state.run_id, &RunRecord::status(&state)).unwrap();

        let loaded = store.load(state.run_id).unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.failure, state.failure);
        assert!(loaded.finished_at.is_some());
    }
}
