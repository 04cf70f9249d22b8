//! Artifact cache keyed by task fingerprints.
//!
//! Entries live in memory for the lifetime of the cache value. When the cache
//! is opened on a directory they are also written to disk as CBOR files named
//! after the fingerprint, so that a later process can reuse them.
//!
//! Within a run the cache guarantees that a fingerprint is computed at most
//! once at a time: whoever asks first computes it, everybody else asking for
//! the same fingerprint waits for that computation to finish.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Artifact;
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;

const EXTENSION: &str = "cbor";

/// How a value was obtained from [`ArtifactCache::get_or_compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Found in memory or on disk, or computed by a concurrent caller.
    Hit,
    /// Computed by this caller.
    Computed,
}

impl Lookup {
    pub fn is_hit(self) -> bool {
        matches!(self, Lookup::Hit)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Serialize, Deserialize)]
struct Entry {
    fingerprint: String,
    artifact: Artifact,
}

/// A computation in progress, others wait on it.
#[derive(Default)]
struct Flight {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Flight {
    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self
                .signal
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self) {
        *lock(&self.done) = true;
        self.signal.notify_all();
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<Fingerprint, Artifact>,
    flights: HashMap<Fingerprint, Arc<Flight>>,
}

/// Removes the in-flight marker when the computing caller is done, whether it
/// succeeded, failed or panicked.
struct FlightGuard<'a> {
    cache: &'a ArtifactCache,
    fingerprint: Fingerprint,
    flight: Arc<Flight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(&self.cache.state).flights.remove(&self.fingerprint);
        self.flight.finish();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ArtifactCache {
    dir: Option<Utf8PathBuf>,
    state: Mutex<State>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ArtifactCache {
    /// A cache that forgets everything when dropped.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A cache persisted in `dir`. The directory is created if missing.
    pub fn open(dir: impl AsRef<Utf8Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir: Some(dir),
            ..Self::default()
        })
    }

    pub fn dir(&self) -> Option<&Utf8Path> {
        self.dir.as_deref()
    }

    /// Returns the cached artifact for a fingerprint, if there is one.
    ///
    /// An entry on disk that can't be decoded is treated as missing and
    /// removed.
    pub fn lookup(&self, fingerprint: Fingerprint) -> Option<Artifact> {
        let found = self.find(fingerprint);
        self.count(found.is_some());
        found
    }

    fn find(&self, fingerprint: Fingerprint) -> Option<Artifact> {
        if let Some(artifact) = lock(&self.state).entries.get(&fingerprint) {
            return Some(artifact.clone());
        }

        let artifact = match self.read(fingerprint) {
            Ok(artifact) => artifact?,
            Err(err) => {
                tracing::warn!("{err}, treating as a cache miss");
                if let Some(path) = self.path(fingerprint) {
                    fs::remove_file(path).ok();
                }
                return None;
            }
        };

        lock(&self.state)
            .entries
            .insert(fingerprint, artifact.clone());

        Some(artifact)
    }

    /// Records an artifact, silently replacing any previous entry.
    pub fn store(&self, fingerprint: Fingerprint, artifact: Artifact) -> Result<(), CacheError> {
        lock(&self.state)
            .entries
            .insert(fingerprint, artifact.clone());

        self.write(fingerprint, artifact)
    }

    /// Drops the entry for a fingerprint, both in memory and on disk.
    pub fn invalidate(&self, fingerprint: Fingerprint) -> Result<(), CacheError> {
        lock(&self.state).entries.remove(&fingerprint);

        if let Some(path) = self.path(fingerprint)
            && path.exists()
        {
            fs::remove_file(path)?;
        }

        Ok(())
    }

    /// Drops every entry.
    pub fn clear(&self) -> Result<(), CacheError> {
        lock(&self.state).entries.clear();

        if let Some(dir) = &self.dir {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == EXTENSION) {
                    fs::remove_file(path)?;
                }
            }
        }

        Ok(())
    }

    /// Number of entries held in memory.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Returns the artifact for a fingerprint, computing it if needed.
    ///
    /// If another caller is already computing the same fingerprint, this
    /// blocks until it is done and reuses its result. If that computation
    /// failed, one of the waiting callers takes over and computes it again.
    pub fn get_or_compute<F, E>(&self, fingerprint: Fingerprint, compute: F) -> Result<(Artifact, Lookup), E>
    where
        F: FnOnce() -> Result<Artifact, E>,
    {
        let flight = loop {
            let waiting = {
                let mut state = lock(&self.state);

                if let Some(artifact) = state.entries.get(&fingerprint) {
                    let artifact = artifact.clone();
                    drop(state);
                    self.count(true);
                    return Ok((artifact, Lookup::Hit));
                }

                match state.flights.get(&fingerprint) {
                    Some(flight) => flight.clone(),
                    None => {
                        let flight = Arc::new(Flight::default());
                        state.flights.insert(fingerprint, flight.clone());
                        break flight;
                    }
                }
            };

            tracing::debug!("waiting for in-flight computation of {fingerprint}");
            waiting.wait();
        };

        let _guard = FlightGuard {
            cache: self,
            fingerprint,
            flight,
        };

        if let Some(artifact) = self.lookup(fingerprint) {
            return Ok((artifact, Lookup::Hit));
        }

        let artifact = compute()?;

        if let Err(err) = self.store(fingerprint, artifact.clone()) {
            tracing::warn!("couldn't persist cache entry {fingerprint}: {err}");
        }

        Ok((artifact, Lookup::Computed))
    }

    fn count(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn path(&self, fingerprint: Fingerprint) -> Option<Utf8PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(fingerprint.to_hex()).with_extension(EXTENSION))
    }

    fn read(&self, fingerprint: Fingerprint) -> Result<Option<Artifact>, CacheError> {
        let Some(path) = self.path(fingerprint) else {
            return Ok(None);
        };

        if !path.exists() {
            return Ok(None);
        }

        let corrupt = |reason: String| CacheError::Corruption {
            path: path.clone(),
            reason,
        };

        let file = File::open(&path).map_err(|e| corrupt(e.to_string()))?;
        let entry: Entry = ciborium::from_reader(BufReader::new(file))
            .map_err(|e| corrupt(e.to_string()))?;

        if entry.fingerprint != fingerprint.to_hex() {
            return Err(corrupt(format!(
                "entry belongs to fingerprint {}",
                entry.fingerprint
            )));
        }

        Ok(Some(entry.artifact))
    }

    /// Writes through a temporary file so that readers never see a partially
    /// written entry.
    fn write(&self, fingerprint: Fingerprint, artifact: Artifact) -> Result<(), CacheError> {
        let Some(path) = self.path(fingerprint) else {
            return Ok(());
        };

        let temp = path.with_extension(format!("{EXTENSION}.tmp"));
        let entry = Entry {
            fingerprint: fingerprint.to_hex(),
            artifact,
        };

        {
            let mut writer = BufWriter::new(File::create(&temp)?);
            ciborium::into_writer(&entry, &mut writer)?;
            writer.flush()?;
        }

        fs::rename(&temp, &path)?;

        Ok(())
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("dir", &self.dir)
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hash32;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fp(seed: &str) -> Fingerprint {
        Fingerprint::from(Hash32::hash(seed))
    }

    fn temp_cache() -> (tempfile::TempDir, ArtifactCache) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("cache")).unwrap();
        let cache = ArtifactCache::open(&path).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_lookup_after_store() {
        let cache = ArtifactCache::in_memory();
        assert!(cache.lookup(fp("a")).is_none());

        cache.store(fp("a"), Artifact::from_text("jar")).unwrap();
        assert_eq!(cache.lookup(fp("a")), Some(Artifact::from_text("jar")));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_store_overwrites() {
        let cache = ArtifactCache::in_memory();
        cache.store(fp("a"), Artifact::from_text("one")).unwrap();
        cache.store(fp("a"), Artifact::from_text("two")).unwrap();
        assert_eq!(cache.lookup(fp("a")), Some(Artifact::from_text("two")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate() {
        let (_dir, cache) = temp_cache();
        cache.store(fp("a"), Artifact::from_text("jar")).unwrap();
        cache.invalidate(fp("a")).unwrap();
        assert!(cache.lookup(fp("a")).is_none());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let (dir, cache) = temp_cache();
        cache.store(fp("a"), Artifact::from_text("jar").with_attribute("k", "v")).unwrap();
        drop(cache);

        let path = Utf8PathBuf::try_from(dir.path().join("cache")).unwrap();
        let reopened = ArtifactCache::open(&path).unwrap();
        assert!(reopened.is_empty());

        let artifact = reopened.lookup(fp("a")).unwrap();
        assert_eq!(artifact.text(), Some("jar"));
        assert_eq!(artifact.attribute("k"), Some("v"));
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let (_dir, cache) = temp_cache();
        let path = cache.path(fp("a")).unwrap();
        fs::write(&path, b"definitely not cbor").unwrap();

        assert!(cache.lookup(fp("a")).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_misplaced_entry_is_a_miss() {
        let (_dir, cache) = temp_cache();
        cache.store(fp("a"), Artifact::from_text("jar")).unwrap();
        fs::copy(cache.path(fp("a")).unwrap(), cache.path(fp("b")).unwrap()).unwrap();

        assert!(cache.lookup(fp("b")).is_none());
    }

    #[test]
    fn test_clear_removes_files() {
        let (_dir, cache) = temp_cache();
        cache.store(fp("a"), Artifact::from_text("a")).unwrap();
        cache.store(fp("b"), Artifact::from_text("b")).unwrap();
        cache.clear().unwrap();

        assert!(cache.is_empty());
        assert!(!cache.path(fp("a")).unwrap().exists());
        assert!(cache.lookup(fp("b")).is_none());
    }

    #[test]
    fn test_get_or_compute_hits_second_time() {
        let cache = ArtifactCache::in_memory();
        let calls = AtomicUsize::new(0);

        let compute = || -> Result<Artifact, ()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Artifact::from_text("jar"))
        };

        let (_, first) = cache.get_or_compute(fp("a"), compute).unwrap();
        let (_, second) = cache.get_or_compute(fp("a"), compute).unwrap();

        assert_eq!(first, Lookup::Computed);
        assert_eq!(second, Lookup::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_callers_share_one_computation() {
        let cache = ArtifactCache::in_memory();
        let calls = AtomicUsize::new(0);

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        cache.get_or_compute(fp("shared"), || -> Result<_, ()> {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(50));
                            Ok(Artifact::from_text("jar"))
                        })
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().0.text() == Some("jar")));
        assert_eq!(
            results
                .iter()
                .filter(|r| r.as_ref().unwrap().1 == Lookup::Computed)
                .count(),
            1
        );
    }

    #[test]
    fn test_failed_computation_is_retried_by_waiter() {
        let cache = ArtifactCache::in_memory();
        let calls = AtomicUsize::new(0);

        let results: Vec<Result<(Artifact, Lookup), String>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        cache.get_or_compute(fp("flaky"), || {
                            let call = calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(30));
                            if call == 0 {
                                Err("first attempt fails".to_string())
                            } else {
                                Ok(Artifact::from_text("jar"))
                            }
                        })
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert_eq!(cache.lookup(fp("flaky")), Some(Artifact::from_text("jar")));
    }
}
