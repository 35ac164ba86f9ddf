//! JSON-file implementation of the run store.
//!
//! One pretty-printed document per run at `.relay/runs/<run_id>.json`.
//! Persist writes a temp file beside the target, fsyncs, then renames over
//! it, so the record on disk is always whole. Writers are last-write-wins
//! per run id.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use super::WorkflowRun;
use crate::errors::RelayError;
use crate::phase::RunStatus;

#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id))
    }

    /// Atomic whole-record upsert keyed by run id. Refreshes the run's
    /// rollups before writing; never partial-merges a record.
    pub fn persist(&self, run: &mut WorkflowRun) -> Result<(), RelayError> {
        run.refresh();
        let path = self.run_path(&run.id);
        let bytes = serde_json::to_vec_pretty(run).map_err(|source| RelayError::Store {
            path: path.clone(),
            source,
        })?;
        atomic_write(&path, &bytes)?;
        debug!(run_id = %run.id, status = %run.status, "persisted run record");
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<WorkflowRun, RelayError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(RelayError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let content =
            fs::read_to_string(&path).map_err(|source| RelayError::io(&path, source))?;
        serde_json::from_str(&content).map_err(|source| RelayError::Store { path, source })
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.run_path(run_id).exists()
    }

    /// Resolve a run id or bare task slug to a stored run id. An exact id
    /// wins; otherwise a `<slug>-` prefix must match exactly one run.
    pub fn resolve(&self, query: &str) -> Result<String, RelayError> {
        if self.exists(query) {
            return Ok(query.to_string());
        }
        let prefix = format!("{}-", query);
        let mut matches: Vec<String> = self
            .list_ids()?
            .into_iter()
            .filter(|id| id.starts_with(&prefix))
            .collect();
        if matches.len() > 1 {
            return Err(RelayError::validation(
                "run",
                format!("'{}' matches {} runs; use the full run id", query, matches.len()),
            ));
        }
        match matches.pop() {
            Some(id) => Ok(id),
            None => Err(RelayError::RunNotFound {
                run_id: query.to_string(),
            }),
        }
    }

    /// All run ids on disk, sorted for stable listings.
    pub fn list_ids(&self) -> Result<Vec<String>, RelayError> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let entries =
            fs::read_dir(&self.runs_dir).map_err(|source| RelayError::io(&self.runs_dir, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| RelayError::io(&self.runs_dir, source))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Lazy scan over runs matching `status`: records load one at a time as
    /// the iterator is driven. Calling again restarts from a fresh listing.
    pub fn list_by_status(&self, status: RunStatus) -> Result<StatusScan<'_>, RelayError> {
        Ok(StatusScan {
            store: self,
            ids: self.list_ids()?.into_iter(),
            status,
        })
    }
}

pub struct StatusScan<'a> {
    store: &'a RunStore,
    ids: std::vec::IntoIter<String>,
    status: RunStatus,
}

impl Iterator for StatusScan<'_> {
    type Item = Result<WorkflowRun, RelayError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.ids.next()?;
            match self.store.load(&id) {
                Ok(run) if run.status == self.status => return Some(Ok(run)),
                Ok(_) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), RelayError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RelayError::io(parent, source))?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("record");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp).map_err(|source| RelayError::io(&tmp, source))?;
    file.write_all(bytes)
        .map_err(|source| RelayError::io(&tmp, source))?;
    file.sync_all()
        .map_err(|source| RelayError::io(&tmp, source))?;
    fs::rename(&tmp, path).map_err(|source| RelayError::io(path, source))?;
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}
