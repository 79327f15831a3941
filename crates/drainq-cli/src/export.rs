use anyhow::Context;
use chrono::{DateTime, Utc};
use drainq::{MessageSnapshot, SubQueueMode};
use std::path::{Path, PathBuf};

/// `messages-<queue>-<mode>-<timestamp>.json`, with characters that are not
/// safe in file names replaced.
pub fn file_name(queue: &str, mode: SubQueueMode, at: DateTime<Utc>) -> String {
    let queue: String = queue
        .rsplit('/')
        .next()
        .unwrap_or(queue)
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    let timestamp = at.format("%Y-%m-%dT%H-%M-%S-%3fZ");
    format!("messages-{queue}-{mode}-{timestamp}.json")
}

/// Writes `snapshots` as a pretty-printed JSON array into `dir` and returns the path.
pub fn write_snapshots<'a>(
    dir: &Path,
    queue: &str,
    mode: SubQueueMode,
    snapshots: impl IntoIterator<Item = &'a MessageSnapshot>,
) -> anyhow::Result<PathBuf> {
    let snapshots: Vec<&MessageSnapshot> = snapshots.into_iter().collect();
    let path = dir.join(file_name(queue, mode, Utc::now()));
    let json = serde_json::to_string_pretty(&snapshots).context("failed to serialize messages")?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
