//! Flat-file store for authenticated account ids.
//!
//! The file holds one integer per line, deduplicated and sorted ascending.
//! Every mutation rewrites the whole file atomically; lines that do not
//! parse as integers are dropped on rewrite.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};

use crate::atomic_io::write_text_atomic;

/// Reads the account ids currently recorded at `path`, sorted ascending.
///
/// A missing file is an empty store, not an error.
pub fn read_account_ids(path: &Path) -> Result<Vec<i64>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read account id store {}", path.display()))?;
    let ids = raw
        .lines()
        .filter_map(|line| line.trim().parse::<i64>().ok())
        .collect::<BTreeSet<_>>();
    Ok(ids.into_iter().collect())
}

/// Records `account_id` in the store at `path`.
///
/// Returns true when the id was newly added, false when it was already
/// present. The file stays deduplicated and numerically sorted either way.
pub fn record_account_id(path: &Path, account_id: i64) -> Result<bool> {
    let mut ids = read_account_ids(path)?
        .into_iter()
        .collect::<BTreeSet<_>>();
    let added = ids.insert(account_id);

    let mut content = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    content.push('\n');
    write_text_atomic(path, &content)?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_store_reads_empty() {
        let tempdir = tempdir().expect("tempdir");
        let path = tempdir.path().join("ids.txt");
        assert!(read_account_ids(&path).expect("read").is_empty());
    }

    #[test]
    fn record_deduplicates_and_sorts() {
        let tempdir = tempdir().expect("tempdir");
        let path = tempdir.path().join("ids.txt");

        assert!(record_account_id(&path, 77700011).expect("record"));
        assert!(record_account_id(&path, 42).expect("record"));
        assert!(!record_account_id(&path, 77700011).expect("record"));

        let ids = read_account_ids(&path).expect("read");
        assert_eq!(ids, vec![42, 77700011]);

        let raw = std::fs::read_to_string(&path).expect("raw");
        assert_eq!(raw, "42\n77700011\n");
    }

    #[test]
    fn malformed_lines_are_dropped_on_rewrite() {
        let tempdir = tempdir().expect("tempdir");
        let path = tempdir.path().join("ids.txt");
        std::fs::write(&path, "12\nnot-a-number\n7\n").expect("seed");

        record_account_id(&path, 99).expect("record");
        let raw = std::fs::read_to_string(&path).expect("raw");
        assert_eq!(raw, "7\n12\n99\n");
    }
}
