//! `falcon generations`: print the counters recorded in a generation log.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;

use crate::enforcer::GenerationLog;
use crate::generation::GenNo;

pub fn read_counters(path: &Path) -> Result<BTreeMap<String, GenNo>> {
    let counters = GenerationLog::replay(path)
        .with_context(|| format!("Failed to replay {}", path.display()))?;
    Ok(counters.into_iter().collect())
}

pub fn execute(path: &Path, json: bool) -> Result<()> {
    let counters = read_counters(path)?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&counters).context("Failed to render counters")?;
        println!("{rendered}");
        return Ok(());
    }

    if counters.is_empty() {
        println!("{} No generations recorded in {}", "─".dimmed(), path.display());
        return Ok(());
    }

    let width = counters.keys().map(String::len).max().unwrap_or(0);
    for (target, counter) in &counters {
        println!("{target:<width$}  {}", counter.to_string().bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_counters_are_sorted_by_target() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gen.log");
        std::fs::write(&path, "web\ndb\nweb\n").unwrap();

        let counters = read_counters(&path).unwrap();
        let listed: Vec<_> = counters.into_iter().collect();
        assert_eq!(listed, vec![("db".to_string(), 1), ("web".to_string(), 2)]);
    }

    #[test]
    fn test_missing_log_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(execute(&dir.path().join("absent.log"), false).is_err());
    }
}
