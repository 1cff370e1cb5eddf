// =============================================================================
// Training Cursor — engine-owned progress marker for the external trainer
// =============================================================================
//
// The trainer backfills history one day at a time and reads its position from
// `ops/training_cursor.json`. The engine owns the file: it loads the cursor
// on startup and persists changes atomically (tmp + rename), the same pattern
// as the quarantine registry.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingCursor {
    /// Next date the trainer should process (YYYY-MM-DD).
    #[serde(default)]
    pub next_date: String,
    /// Earliest date worth training on (YYYY-MM-DD).
    #[serde(default)]
    pub lower_bound: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    /// What to do at the lower bound: "wrap" restarts, "stop" halts.
    #[serde(default)]
    pub wrap_mode: String,
}

pub struct TrainingCursorStore {
    cursor: Mutex<TrainingCursor>,
    path: PathBuf,
}

impl TrainingCursorStore {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let cursor = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<TrainingCursor>(&raw) {
                Ok(cursor) => {
                    info!(path = %path.display(), next_date = %cursor.next_date, "training cursor loaded");
                    cursor
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt training cursor — starting empty");
                    TrainingCursor::default()
                }
            },
            Err(_) => TrainingCursor::default(),
        };
        Self {
            cursor: Mutex::new(cursor),
            path,
        }
    }

    pub fn get(&self) -> TrainingCursor {
        self.cursor.lock().clone()
    }

    pub fn set(&self, cursor: TrainingCursor) -> Result<()> {
        let mut guard = self.cursor.lock();
        *guard = cursor;
        self.write_atomic(&guard)
    }

    fn write_atomic(&self, cursor: &TrainingCursor) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        let content =
            serde_json::to_string_pretty(cursor).context("failed to serialise training cursor")?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }
}
