// Run directory persistence: run snapshot, checkpoint, workflow event log,
// and per-iteration history, all under <data_dir>/runs/<run_id>/.

use std::path::{Path, PathBuf};

use convoy_types::{Checkpoint, IterationRecord, WorkflowEvent, WorkflowRun};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::Result;

/// Default data directory for run state, resolved per platform.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("convoy"))
        .unwrap_or_else(|| PathBuf::from(".convoy"))
}

/// Filesystem layout of one run. `run.json`, `tasks.json`, and
/// `checkpoint.json` are replaced atomically; `events.log` and
/// `history.jsonl` are append-only NDJSON.
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(data_dir: impl AsRef<Path>, run_id: &str) -> Self {
        Self {
            dir: data_dir.as_ref().join("runs").join(run_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_path(&self) -> PathBuf {
        self.dir.join("run.json")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.dir.join("tasks.json")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.log")
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.write_atomic(&self.run_path(), run).await
    }

    pub async fn load_run(&self) -> Result<Option<WorkflowRun>> {
        self.read_optional(&self.run_path()).await
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.write_atomic(&self.checkpoint_path(), checkpoint).await
    }

    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        self.read_optional(&self.checkpoint_path()).await
    }

    pub async fn append_event(&self, event: &WorkflowEvent) -> Result<()> {
        self.append_line(&self.events_path(), event).await
    }

    /// All workflow events recorded for the run. Lines that fail to parse
    /// are skipped with a warning, never an error.
    pub async fn load_events(&self) -> Result<Vec<WorkflowEvent>> {
        self.read_lines(&self.events_path()).await
    }

    pub async fn append_history(&self, record: &IterationRecord) -> Result<()> {
        self.append_line(&self.history_path(), record).await
    }

    pub async fn load_history(&self) -> Result<Vec<IterationRecord>> {
        self.read_lines(&self.history_path()).await
    }

    async fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir().await?;
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_string_pretty(value)?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_optional<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir().await?;
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable log line");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use convoy_types::{TurnOutcome, WorkflowLimits, WorkflowPhase};
    use tempfile::TempDir;

    #[tokio::test]
    async fn run_snapshot_roundtrips_and_missing_is_none() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path(), "run_1");
        assert!(store.load_run().await.expect("load").is_none());

        let mut run = WorkflowRun::new("run_1", "ship it", "mock", WorkflowLimits::default());
        run.iteration = 7;
        store.save_run(&run).await.expect("save");

        let loaded = store.load_run().await.expect("load").expect("present");
        assert_eq!(loaded.iteration, 7);
        assert_eq!(loaded.objective, "ship it");
    }

    #[tokio::test]
    async fn checkpoint_roundtrips() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path(), "run_1");
        let checkpoint = Checkpoint {
            run_id: "run_1".to_string(),
            phase: WorkflowPhase::Implementing,
            iteration: 3,
            review_iteration: 0,
            remaining_task_ids: vec!["task_2".to_string()],
            session_id: Some("ses_1".to_string()),
            objective: "ship it".to_string(),
            created_at: Utc::now(),
        };
        store.save_checkpoint(&checkpoint).await.expect("save");

        let loaded = store
            .load_checkpoint()
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.iteration, 3);
        assert_eq!(loaded.remaining_task_ids, vec!["task_2".to_string()]);
    }

    #[tokio::test]
    async fn event_log_skips_unreadable_lines() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path(), "run_1");
        store
            .append_event(&WorkflowEvent::RunStarted {
                run_id: "run_1".to_string(),
                objective: "ship it".to_string(),
                provider: "mock".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .expect("append");

        // A torn write must not poison the log.
        let mut raw = std::fs::read_to_string(store.events_path()).expect("read");
        raw.push_str("{\"type\": \"run_sta");
        raw.push('\n');
        std::fs::write(store.events_path(), raw).expect("write");

        store
            .append_event(&WorkflowEvent::RunFinished {
                run_id: "run_1".to_string(),
                outcome: convoy_types::TerminalOutcome::Completed,
                checkpoint_path: None,
                timestamp: Utc::now(),
            })
            .await
            .expect("append");

        let events = store.load_events().await.expect("load");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WorkflowEvent::RunStarted { .. }));
        assert!(matches!(events[1], WorkflowEvent::RunFinished { .. }));
    }

    #[tokio::test]
    async fn history_appends_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let store = RunStore::new(dir.path(), "run_1");
        for iteration in 1..=2 {
            let now = Utc::now();
            store
                .append_history(&IterationRecord {
                    iteration,
                    started_at: now,
                    ended_at: now,
                    duration_ms: 12,
                    outcome: TurnOutcome::Completed,
                    tools_used: Default::default(),
                    tasks_total: 3,
                    tasks_completed: iteration as usize,
                    delegates_spawned: 0,
                    errors: Vec::new(),
                    usage: None,
                })
                .await
                .expect("append");
        }
        let history = store.load_history().await.expect("load");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].iteration, 2);
    }

    #[test]
    fn default_data_dir_is_convoy_scoped() {
        let name = default_data_dir()
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_default();
        assert!(name.contains("convoy"));
    }
}
