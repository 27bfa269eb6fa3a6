use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

pub const KILLS_FILE: &str = "tank_kills.jsonl";
pub const REPORTS_FILE: &str = "match_reports.jsonl";

/// Append-only flat-file mirror of kill attributions and final match
/// reports. State stays in memory; this log only exists so results survive a
/// process restart.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Store {
        Store { dir: dir.into() }
    }

    pub fn append_jsonl<T: Serialize>(&self, file_name: &str, record: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed creating data dir {}", self.dir.display()))?;
        let path = self.dir.join(file_name);
        let mut line = serde_json::to_string(record).context("failed serializing record")?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed opening {}", path.display()))?
            .write_all(line.as_bytes())
            .with_context(|| format!("failed appending to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::SystemTime};

    use serde_json::json;

    use super::Store;

    #[test]
    fn appends_one_record_per_line() {
        let unique = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("overwatch_store_{unique}"));
        let store = Store::new(&dir);

        store
            .append_jsonl("kills.jsonl", &json!({"killer": "Able", "n": 1}))
            .expect("first append should succeed");
        store
            .append_jsonl("kills.jsonl", &json!({"killer": "Baker", "n": 2}))
            .expect("second append should succeed");

        let text = fs::read_to_string(dir.join("kills.jsonl")).expect("file should exist");
        fs::remove_dir_all(&dir).ok();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value =
            serde_json::from_str(lines[0]).expect("line should be valid json");
        assert_eq!(first["killer"], "Able");
    }
}
