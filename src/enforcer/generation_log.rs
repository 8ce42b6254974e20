//! Durable generation counters.
//!
//! The log is an append-only text file holding one target name per line; each
//! line records one increment of that target's counter. Replaying the file in
//! order rebuilds every counter. The file is held under an exclusive advisory
//! lock for as long as the enforcer runs, so two enforcers never share a log.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::generation::GenNo;

#[derive(Debug, Error)]
pub enum GenerationLogError {
    #[error("failed to open generation log {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("generation log {} is held by another enforcer", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read generation log {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to append to generation log {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to sync generation log {}: {source}", path.display())]
    Sync {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("target name {name:?} cannot be recorded in the generation log")]
    InvalidTarget { name: String },
}

pub struct GenerationLog {
    path: PathBuf,
    file: File,
    counters: HashMap<String, GenNo>,
}

impl GenerationLog {
    /// Open (creating if needed) and lock the log, then replay it.
    ///
    /// A torn final line left by a crash mid-append is discarded and cut off
    /// the file so later appends start on a clean line.
    pub fn open(path: &Path) -> Result<Self, GenerationLogError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|source| GenerationLogError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        file.try_lock_exclusive()
            .map_err(|source| GenerationLogError::Lock {
                path: path.to_path_buf(),
                source,
            })?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|source| GenerationLogError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let (counters, complete) = parse(&contents);
        if complete < contents.len() {
            warn!(
                path = %path.display(),
                dropped = contents.len() - complete,
                "discarding torn tail of generation log"
            );
            file.set_len(complete as u64)
                .map_err(|source| GenerationLogError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        info!(path = %path.display(), targets = counters.len(), "replayed generation log");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            counters,
        })
    }

    /// Read the counters recorded in `path` without taking ownership of it.
    pub fn replay(path: &Path) -> Result<HashMap<String, GenNo>, GenerationLogError> {
        let contents = fs::read(path).map_err(|source| GenerationLogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(parse(&contents).0)
    }

    /// Whether `name` can be written as a single log line.
    pub fn is_recordable(name: &str) -> bool {
        !name.is_empty() && !name.contains('\n')
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> GenNo {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &HashMap<String, GenNo> {
        &self.counters
    }

    /// Durably record one increment for `name` and return the new counter.
    ///
    /// The in-memory counter only advances once the line has been written,
    /// flushed and synced. Filesystems that cannot sync (read-only or not
    /// supporting it) are accepted without durability.
    pub fn increment(&mut self, name: &str) -> Result<GenNo, GenerationLogError> {
        if !Self::is_recordable(name) {
            return Err(GenerationLogError::InvalidTarget {
                name: name.to_string(),
            });
        }

        self.file
            .write_all(format!("{name}\n").as_bytes())
            .map_err(|source| GenerationLogError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.file.flush().map_err(|source| GenerationLogError::Write {
            path: self.path.clone(),
            source,
        })?;
        if let Err(source) = self.file.sync_all() {
            match source.raw_os_error() {
                Some(libc::EROFS) | Some(libc::EINVAL) => {
                    warn!(path = %self.path.display(), error = %source, "generation log is not durable");
                }
                _ => {
                    return Err(GenerationLogError::Sync {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }

        let counter = self.counters.entry(name.to_string()).or_insert(0);
        *counter = counter.wrapping_add(1);
        info!(target = name, generation = *counter, "generation incremented");
        Ok(*counter)
    }

    /// Bring `name` to `value`. Higher values are reached through logged
    /// increments; a lower value only rewinds the in-memory counter.
    pub fn fast_forward(&mut self, name: &str, value: GenNo) -> Result<(), GenerationLogError> {
        let current = self.get(name);
        if value < current {
            warn!(target = name, from = current, to = value, "rewinding generation in memory");
            self.counters.insert(name.to_string(), value);
            return Ok(());
        }
        while self.get(name) < value {
            self.increment(name)?;
        }
        Ok(())
    }
}

/// Count complete lines. Returns the counters and the byte length of the
/// complete prefix.
fn parse(contents: &[u8]) -> (HashMap<String, GenNo>, usize) {
    let complete = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);

    let mut counters: HashMap<String, GenNo> = HashMap::new();
    for line in contents[..complete].split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(line).into_owned();
        let counter = counters.entry(name).or_insert(0);
        *counter = counter.wrapping_add(1);
    }
    (counters, complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_path(dir: &TempDir) -> PathBuf {
        dir.path().join("generations.log")
    }

    #[test]
    fn test_new_log_starts_at_zero() {
        let dir = TempDir::new().unwrap();
        let log = GenerationLog::open(&log_path(&dir)).unwrap();
        assert_eq!(log.get("appA"), 0);
        assert!(log.counters().is_empty());
    }

    #[test]
    fn test_increment_appends_one_line() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let mut log = GenerationLog::open(&path).unwrap();

        assert_eq!(log.increment("appA").unwrap(), 1);
        assert_eq!(log.increment("appA").unwrap(), 2);
        assert_eq!(log.increment("appB").unwrap(), 1);

        assert_eq!(fs::read_to_string(&path).unwrap(), "appA\nappA\nappB\n");
    }

    #[test]
    fn test_reopen_replays_counters() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        {
            let mut log = GenerationLog::open(&path).unwrap();
            log.increment("appA").unwrap();
            log.increment("appB").unwrap();
            log.increment("appA").unwrap();
        }

        let log = GenerationLog::open(&path).unwrap();
        assert_eq!(log.get("appA"), 2);
        assert_eq!(log.get("appB"), 1);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        fs::write(&path, "appA\nappB\nap").unwrap();

        let mut log = GenerationLog::open(&path).unwrap();
        assert_eq!(log.get("appA"), 1);
        assert_eq!(log.get("ap"), 0);

        log.increment("appA").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "appA\nappB\nappA\n");
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let _held = GenerationLog::open(&path).unwrap();

        let err = GenerationLog::open(&path).err().unwrap();
        assert!(matches!(err, GenerationLogError::Lock { .. }));
    }

    #[test]
    fn test_replay_reads_without_locking() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let mut log = GenerationLog::open(&path).unwrap();
        log.increment("vm1").unwrap();
        log.increment("vm1").unwrap();

        let counters = GenerationLog::replay(&path).unwrap();
        assert_eq!(counters.get("vm1"), Some(&2));
    }

    #[test]
    fn test_replay_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = GenerationLog::replay(&dir.path().join("absent.log")).unwrap_err();
        assert!(matches!(err, GenerationLogError::Read { .. }));
    }

    #[test]
    fn test_rejects_unrecordable_names() {
        let dir = TempDir::new().unwrap();
        let mut log = GenerationLog::open(&log_path(&dir)).unwrap();

        assert!(matches!(
            log.increment(""),
            Err(GenerationLogError::InvalidTarget { .. })
        ));
        assert!(matches!(
            log.increment("a\nb"),
            Err(GenerationLogError::InvalidTarget { .. })
        ));
        assert!(log.counters().is_empty());
    }

    #[test]
    fn test_fast_forward_logs_each_step() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let mut log = GenerationLog::open(&path).unwrap();

        log.fast_forward("appA", 3).unwrap();
        assert_eq!(log.get("appA"), 3);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_fast_forward_backwards_rewinds_in_memory_only() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let mut log = GenerationLog::open(&path).unwrap();
        log.increment("appA").unwrap();
        log.increment("appA").unwrap();

        log.fast_forward("appA", 1).unwrap();
        assert_eq!(log.get("appA"), 1);
        assert_eq!(GenerationLog::replay(&path).unwrap().get("appA"), Some(&2));
    }
}
