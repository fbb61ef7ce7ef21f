use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::now_utc_iso;

/// Per-participant state of one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeProgress {
    pub id: String,
    pub challenge_id: String,
    pub participant: String,
    pub photos_uploaded: u64,
    pub is_completed: bool,
    pub completed_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressUpdate {
    Applied(ChallengeProgress),
    /// Completion was requested but the record was already completed; nothing changed.
    AlreadyCompleted(ChallengeProgress),
}

impl ProgressUpdate {
    pub fn progress(&self) -> &ChallengeProgress {
        match self {
            Self::Applied(progress) | Self::AlreadyCompleted(progress) => progress,
        }
    }
}

/// Storage of challenge progress.
///
/// `mark_progress` and `record_attempt` with `completed = true` are conditional updates: they only
/// succeed when the record is not completed yet, which settles races between two concurrent valid
/// uploads.
pub trait ProgressLedger: Send + Sync {
    fn get_or_create(
        &self,
        challenge_id: &str,
        participant: &str,
    ) -> anyhow::Result<ChallengeProgress>;

    fn get(
        &self,
        challenge_id: &str,
        participant: &str,
    ) -> anyhow::Result<Option<ChallengeProgress>>;

    fn mark_progress(
        &self,
        id: &str,
        photos_uploaded: u64,
        completed: bool,
    ) -> anyhow::Result<ProgressUpdate>;

    /// Counts one more upload against the stored value, under the ledger's own lock.
    ///
    /// A conditional completion that finds the record already completed changes nothing, the
    /// count included. An attempt without completion never clears an earlier completion.
    fn record_attempt(&self, id: &str, completed: bool) -> anyhow::Result<ProgressUpdate>;

    /// Undoes a completion whose photo could not be stored. The upload count is kept.
    fn revert_completion(&self, id: &str) -> anyhow::Result<ChallengeProgress>;

    /// Administrative reset of completion state and upload count.
    fn reset(&self, id: &str) -> anyhow::Result<ChallengeProgress>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct LedgerState {
    schema_version: u64,
    records: IndexMap<String, ChallengeProgress>,
}

impl LedgerState {
    fn find(&self, challenge_id: &str, participant: &str) -> Option<&ChallengeProgress> {
        self.records.values().find(|record| {
            record.challenge_id == challenge_id && record.participant == participant
        })
    }

    /// Returns the record and whether it was newly created.
    fn get_or_create(
        &mut self,
        challenge_id: &str,
        participant: &str,
    ) -> (ChallengeProgress, bool) {
        if let Some(existing) = self.find(challenge_id, participant) {
            return (existing.clone(), false);
        }
        let record = ChallengeProgress {
            id: Uuid::new_v4().to_string(),
            challenge_id: challenge_id.to_string(),
            participant: participant.to_string(),
            photos_uploaded: 0,
            is_completed: false,
            completed_at: None,
            created_at: now_utc_iso(),
        };
        self.records.insert(record.id.clone(), record.clone());
        (record, true)
    }

    fn mark_progress(
        &mut self,
        id: &str,
        photos_uploaded: u64,
        completed: bool,
    ) -> anyhow::Result<ProgressUpdate> {
        let Some(record) = self.records.get_mut(id) else {
            bail!("unknown progress record '{id}'");
        };
        if completed && record.is_completed {
            return Ok(ProgressUpdate::AlreadyCompleted(record.clone()));
        }
        record.photos_uploaded = photos_uploaded;
        if completed {
            record.is_completed = true;
            record.completed_at = Some(now_utc_iso());
        }
        Ok(ProgressUpdate::Applied(record.clone()))
    }

    fn record_attempt(&mut self, id: &str, completed: bool) -> anyhow::Result<ProgressUpdate> {
        let Some(current) = self.records.get(id) else {
            bail!("unknown progress record '{id}'");
        };
        let next = current.photos_uploaded.saturating_add(1);
        self.mark_progress(id, next, completed)
    }

    fn revert_completion(&mut self, id: &str) -> anyhow::Result<ChallengeProgress> {
        let Some(record) = self.records.get_mut(id) else {
            bail!("unknown progress record '{id}'");
        };
        record.is_completed = false;
        record.completed_at = None;
        Ok(record.clone())
    }

    fn reset(&mut self, id: &str) -> anyhow::Result<ChallengeProgress> {
        let Some(record) = self.records.get_mut(id) else {
            bail!("unknown progress record '{id}'");
        };
        record.photos_uploaded = 0;
        record.is_completed = false;
        record.completed_at = None;
        Ok(record.clone())
    }
}

#[derive(Debug, Default)]
pub struct MemoryProgressLedger {
    state: Mutex<LedgerState>,
}

impl MemoryProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(
        &self,
        apply: impl FnOnce(&mut LedgerState) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("progress ledger lock poisoned"))?;
        apply(&mut state)
    }
}

impl ProgressLedger for MemoryProgressLedger {
    fn get_or_create(
        &self,
        challenge_id: &str,
        participant: &str,
    ) -> anyhow::Result<ChallengeProgress> {
        self.with_state(|state| Ok(state.get_or_create(challenge_id, participant).0))
    }

    fn get(
        &self,
        challenge_id: &str,
        participant: &str,
    ) -> anyhow::Result<Option<ChallengeProgress>> {
        self.with_state(|state| Ok(state.find(challenge_id, participant).cloned()))
    }

    fn mark_progress(
        &self,
        id: &str,
        photos_uploaded: u64,
        completed: bool,
    ) -> anyhow::Result<ProgressUpdate> {
        self.with_state(|state| state.mark_progress(id, photos_uploaded, completed))
    }

    fn record_attempt(&self, id: &str, completed: bool) -> anyhow::Result<ProgressUpdate> {
        self.with_state(|state| state.record_attempt(id, completed))
    }

    fn revert_completion(&self, id: &str) -> anyhow::Result<ChallengeProgress> {
        self.with_state(|state| state.revert_completion(id))
    }

    fn reset(&self, id: &str) -> anyhow::Result<ChallengeProgress> {
        self.with_state(|state| state.reset(id))
    }
}

/// Ledger persisted as a pretty-printed JSON document.
///
/// Every operation re-reads the file under the mutex and rewrites it only when something
/// changed. A malformed file is an error rather than an empty ledger, so completion state is
/// never silently dropped.
#[derive(Debug)]
pub struct JsonProgressLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonProgressLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn transact<T>(
        &self,
        apply: impl FnOnce(&mut LedgerState) -> anyhow::Result<(T, bool)>,
    ) -> anyhow::Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("progress ledger lock poisoned"))?;
        let mut state = read_ledger(&self.path)?;
        let (out, dirty) = apply(&mut state)?;
        if dirty {
            state.schema_version = 1;
            write_ledger(&self.path, &state)?;
        }
        Ok(out)
    }
}

impl ProgressLedger for JsonProgressLedger {
    fn get_or_create(
        &self,
        challenge_id: &str,
        participant: &str,
    ) -> anyhow::Result<ChallengeProgress> {
        self.transact(|state| Ok(state.get_or_create(challenge_id, participant)))
    }

    fn get(
        &self,
        challenge_id: &str,
        participant: &str,
    ) -> anyhow::Result<Option<ChallengeProgress>> {
        self.transact(|state| Ok((state.find(challenge_id, participant).cloned(), false)))
    }

    fn mark_progress(
        &self,
        id: &str,
        photos_uploaded: u64,
        completed: bool,
    ) -> anyhow::Result<ProgressUpdate> {
        self.transact(|state| {
            let update = state.mark_progress(id, photos_uploaded, completed)?;
            let dirty = matches!(update, ProgressUpdate::Applied(_));
            Ok((update, dirty))
        })
    }

    fn record_attempt(&self, id: &str, completed: bool) -> anyhow::Result<ProgressUpdate> {
        self.transact(|state| {
            let update = state.record_attempt(id, completed)?;
            let dirty = matches!(update, ProgressUpdate::Applied(_));
            Ok((update, dirty))
        })
    }

    fn revert_completion(&self, id: &str) -> anyhow::Result<ChallengeProgress> {
        self.transact(|state| Ok((state.revert_completion(id)?, true)))
    }

    fn reset(&self, id: &str) -> anyhow::Result<ChallengeProgress> {
        self.transact(|state| Ok((state.reset(id)?, true)))
    }
}

fn read_ledger(path: &Path) -> anyhow::Result<LedgerState> {
    if !path.exists() {
        return Ok(LedgerState::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading progress ledger {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(LedgerState::default());
    }
    serde_json::from_str(&raw)
        .with_context(|| format!("progress ledger {} is not valid JSON", path.display()))
}

fn write_ledger(path: &Path, state: &LedgerState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(state)?)
        .with_context(|| format!("failed writing progress ledger {}", path.display()))?;
    Ok(())
}
