//! JSONL attempt logs for transpile sessions.
//!
//! Every attempt record of a session is written as a single line in
//! `{config_dir}/attempt-logs/YYYY-MM-DD/{session_id}.jsonl`. Best-effort:
//! never panics or fails the caller.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::correction::AttemptRecord;

#[derive(Serialize)]
struct AttemptLogEntry<'a> {
    ts: u64,
    session_id: Uuid,
    #[serde(flatten)]
    record: &'a AttemptRecord,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Append a session's attempt log to today's directory. Returns the file
/// written, or None if nothing could be written.
pub fn log_attempts(config_dir: &Path, session_id: Uuid, records: &[AttemptRecord]) -> Option<PathBuf> {
    let now = now_secs();
    let path = crate::paths::attempt_log_file(
        config_dir,
        &date_from_epoch(now),
        &session_id.to_string(),
    );
    fs::create_dir_all(path.parent()?).ok()?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .ok()?;
    for record in records {
        let entry = AttemptLogEntry {
            ts: now,
            session_id,
            record,
        };
        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(file, "{json}");
        }
    }
    Some(path)
}

/// Format epoch seconds as `YYYY-MM-DD` without external deps.
#[allow(clippy::unreadable_literal, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn date_from_epoch(epoch_secs: u64) -> String {
    // Civil date from day count (algorithm from Howard Hinnant)
    let days = (epoch_secs / 86400) as i64;
    let z = days + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = (z - era * 146097) as u64; // day of era [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = (yoe as i64) + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::correction::Action;
    use crate::dsl::error::DefectKind;

    #[test]
    fn test_date_from_epoch() {
        // 2025-02-24 00:00:00 UTC = 1740355200
        assert_eq!(date_from_epoch(1_740_355_200), "2025-02-24");
        assert_eq!(date_from_epoch(0), "1970-01-01");
        assert_eq!(date_from_epoch(946_684_800), "2000-01-01");
        assert_eq!(date_from_epoch(1_740_355_200 + 86399), "2025-02-24");
    }

    #[test]
    fn test_log_attempts_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let records = vec![
            AttemptRecord {
                attempt_number: 1,
                defects_before: 2,
                defects_after: 0,
                action_taken: Action::Repaired {
                    fixed: vec![DefectKind::DuplicateDefinition],
                },
            },
            AttemptRecord {
                attempt_number: 1,
                defects_before: 0,
                defects_after: 0,
                action_taken: Action::Accepted,
            },
        ];
        let path = log_attempts(dir.path(), id, &records).expect("log written");
        assert!(path.starts_with(crate::paths::attempt_logs_dir(dir.path())));

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["session_id"], id.to_string());
        assert_eq!(lines[0]["attempt_number"], 1);
        assert_eq!(lines[1]["action_taken"]["action"], "accepted");
    }

    #[test]
    fn test_log_attempts_no_panic() {
        // A config dir that is a file cannot hold a log directory
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(log_attempts(file.path(), Uuid::new_v4(), &[]).is_none());
    }
}
