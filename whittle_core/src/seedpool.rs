//! Bandit-scored seed selection.
//!
//! A fuzzing campaign keeps a directory of seed files and spends more
//! time on the seeds that keep paying off. [`SeedPool`] wraps the
//! bandit engine around that set, keyed by content hash, with payloads
//! that remember where each seed came from.

use std::fs;
use std::path::{Path, PathBuf};

use rand_core::RngCore;
use thiserror::Error;
use tracing::debug;

use crate::bandit::{BanditError, MultiArmedBandit, SelectionPolicy};

#[derive(Error, Debug)]
pub enum SeedPoolError {
    /// The file exists but carries no bytes to fuzz.
    #[error("seed file {} is empty", .path.display())]
    MissingPayload { path: PathBuf },
    #[error("i/o failure while loading seeds: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bandit(#[from] BanditError),
}

/// One seed file held by the pool.
#[derive(Debug, Clone)]
pub struct SeedEntry {
    key: String,
    path: PathBuf,
    bytes: Vec<u8>,
}

impl SeedEntry {
    /// md5 hex of the content; doubles as the pool key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Seed files scored by success/trial history, drawn through a
/// [`MultiArmedBandit`] keyed by content hash.
#[derive(Debug)]
pub struct SeedPool {
    engine: MultiArmedBandit<String, SeedEntry>,
}

impl SeedPool {
    pub fn new(policy: SelectionPolicy) -> Result<Self, SeedPoolError> {
        Ok(Self {
            engine: MultiArmedBandit::new(policy)?,
        })
    }

    /// Registers one seed file and returns its key. Content-addressed:
    /// bytes already in the pool keep their existing arm and path, and
    /// the call just returns the key. Empty files are refused.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<String, SeedPoolError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(SeedPoolError::MissingPayload {
                path: path.to_path_buf(),
            });
        }
        self.add_bytes(path.to_path_buf(), bytes)
    }

    /// Loads every regular file in `dir`, skipping empty ones. Files
    /// are taken in name order so a pool loads the same way everywhere.
    /// Returns how many new entries the scan added.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize, SeedPoolError> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let path = dir_entry?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        let before = self.engine.len();
        for path in paths {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                debug!(path = %path.display(), "skipping empty seed file");
                continue;
            }
            self.add_bytes(path, bytes)?;
        }
        Ok(self.engine.len() - before)
    }

    fn add_bytes(&mut self, path: PathBuf, bytes: Vec<u8>) -> Result<String, SeedPoolError> {
        let key = format!("{:x}", md5::compute(&bytes));
        if self.engine.contains_key(&key) {
            return Ok(key);
        }
        let entry = SeedEntry {
            key: key.clone(),
            path,
            bytes,
        };
        self.engine.add_item(key.clone(), entry)?;
        Ok(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<SeedEntry> {
        self.engine.del_item(&key.to_owned())
    }

    pub fn record_success(&mut self, key: &str, successes: u64) -> Result<(), SeedPoolError> {
        self.engine.record_success(&key.to_owned(), successes)?;
        Ok(())
    }

    pub fn record_tries(&mut self, key: &str, tries: u64) -> Result<(), SeedPoolError> {
        self.engine.record_tries(&key.to_owned(), tries)?;
        Ok(())
    }

    /// Draws a seed under the engine's policy. Entries whose backing
    /// file has vanished are retired and the draw repeats, so a
    /// selection always points at a file that existed just now.
    pub fn next(&mut self, rng: &mut dyn RngCore) -> Result<Option<&SeedEntry>, SeedPoolError> {
        loop {
            let Some(key) = self.engine.next(rng)?.map(|entry| entry.key.clone()) else {
                return Ok(None);
            };
            let alive = self
                .engine
                .get(&key)
                .map(|entry| entry.path.exists())
                .unwrap_or(false);
            if alive {
                return Ok(self.engine.get(&key));
            }
            debug!(%key, "retiring seed whose file vanished");
            self.engine.del_item(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SeedEntry> {
        self.engine.get(&key.to_owned())
    }

    /// Read access to the underlying engine, for score reporting.
    pub fn engine(&self) -> &MultiArmedBandit<String, SeedEntry> {
        &self.engine
    }
}
