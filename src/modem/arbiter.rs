//! Exclusive acquisition of modem lines.
//!
//! One physical line carries one call; the arbiter is the only ordering
//! point between concurrent dial attempts. There is no wait queue: a busy
//! line is an immediate failure the caller may retry at its own cadence.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("modem busy: connected to {site}")]
    Busy { site: String },
    #[error("no modem device available")]
    DeviceMissing,
}

/// Mutual exclusion over one modem or a small pool of them. Acquire and
/// release pair per caller; release is idempotent.
pub trait Arbiter: Send + Sync {
    /// Claim a line for `site`. The returned path is the device to open.
    fn acquire(&self, site: &str) -> Result<PathBuf, ArbiterError>;

    /// Return a line to idle. Releasing an already-idle line is a no-op.
    fn release(&self, path: &Path);

    /// Names of sites currently holding a line.
    fn active_sites(&self) -> BTreeSet<String>;

    /// (free, total) line counts.
    fn available(&self) -> (usize, usize);
}

/// Arbiter for a single fixed device.
pub struct DeviceLock {
    device_path: PathBuf,
    active_site: Mutex<Option<String>>,
}

impl DeviceLock {
    pub fn new(device_path: PathBuf) -> Self {
        Self {
            device_path,
            active_site: Mutex::new(None),
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn active_site(&self) -> Option<String> {
        self.active_site.lock().unwrap().clone()
    }

    pub fn is_available(&self) -> bool {
        self.active_site.lock().unwrap().is_none()
    }
}

impl Arbiter for DeviceLock {
    fn acquire(&self, site: &str) -> Result<PathBuf, ArbiterError> {
        let mut active = self.active_site.lock().unwrap();
        if let Some(holder) = active.as_ref() {
            return Err(ArbiterError::Busy {
                site: holder.clone(),
            });
        }
        if !self.device_path.exists() {
            warn!(device = %self.device_path.display(), "modem device node missing");
            return Err(ArbiterError::DeviceMissing);
        }
        *active = Some(site.to_string());
        info!(device = %self.device_path.display(), site = %site, "modem acquired");
        Ok(self.device_path.clone())
    }

    fn release(&self, _path: &Path) {
        let mut active = self.active_site.lock().unwrap();
        if let Some(site) = active.take() {
            info!(device = %self.device_path.display(), site = %site, "modem released");
        }
    }

    fn active_sites(&self) -> BTreeSet<String> {
        self.active_site.lock().unwrap().iter().cloned().collect()
    }

    fn available(&self) -> (usize, usize) {
        if self.is_available() {
            (1, 1)
        } else {
            (0, 1)
        }
    }
}

/// Arbiter over a family of devices. Paths whose character node has
/// disappeared since startup are pruned at acquire time.
pub struct DevicePool {
    devices: Mutex<BTreeMap<PathBuf, Option<String>>>,
}

impl DevicePool {
    /// Probe `{prefix}{0..count}` and pool the paths that exist.
    pub fn probe(prefix: &str, count: usize) -> Self {
        let mut devices = BTreeMap::new();
        for idx in 0..count {
            let path = PathBuf::from(format!("{prefix}{idx}"));
            if path.exists() {
                devices.insert(path, None);
            }
        }
        info!(lines = devices.len(), probed = count, "modem pool probed");
        Self {
            devices: Mutex::new(devices),
        }
    }

    pub fn from_paths(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            devices: Mutex::new(paths.into_iter().map(|p| (p, None)).collect()),
        }
    }
}

impl Arbiter for DevicePool {
    fn acquire(&self, site: &str) -> Result<PathBuf, ArbiterError> {
        let mut devices = self.devices.lock().unwrap();

        let gone: Vec<PathBuf> = devices
            .keys()
            .filter(|path| !path.exists())
            .cloned()
            .collect();
        for path in gone {
            warn!(device = %path.display(), "pruning vanished modem device");
            devices.remove(&path);
        }

        for (path, holder) in devices.iter_mut() {
            if holder.is_none() {
                *holder = Some(site.to_string());
                info!(device = %path.display(), site = %site, "modem acquired");
                return Ok(path.clone());
            }
        }
        Err(ArbiterError::DeviceMissing)
    }

    fn release(&self, path: &Path) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(holder) = devices.get_mut(path) {
            if let Some(site) = holder.take() {
                info!(device = %path.display(), site = %site, "modem released");
            }
        }
    }

    fn active_sites(&self) -> BTreeSet<String> {
        self.devices
            .lock()
            .unwrap()
            .values()
            .filter_map(|holder| holder.clone())
            .collect()
    }

    fn available(&self) -> (usize, usize) {
        let devices = self.devices.lock().unwrap();
        let free = devices.values().filter(|holder| holder.is_none()).count();
        (free, devices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn fake_device(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        File::create(&path).unwrap();
        path
    }

    #[test]
    fn single_lock_acquire_release_cycle() {
        let dir = TempDir::new().unwrap();
        let path = fake_device(&dir, "ttySL0");
        let lock = DeviceLock::new(path.clone());

        assert!(lock.is_available());
        let acquired = lock.acquire("2broadway").unwrap();
        assert_eq!(acquired, path);
        assert_eq!(lock.active_site().as_deref(), Some("2broadway"));
        assert_eq!(lock.available(), (0, 1));

        match lock.acquire("annex").unwrap_err() {
            ArbiterError::Busy { site } => assert_eq!(site, "2broadway"),
            other => panic!("unexpected error: {other}"),
        }

        lock.release(&path);
        assert!(lock.is_available());
        lock.release(&path); // idempotent
        assert!(lock.acquire("annex").is_ok());
    }

    #[test]
    fn single_lock_missing_device() {
        let dir = TempDir::new().unwrap();
        let lock = DeviceLock::new(dir.path().join("ttyGONE"));
        assert!(matches!(
            lock.acquire("x").unwrap_err(),
            ArbiterError::DeviceMissing
        ));
    }

    #[test]
    fn concurrent_acquires_yield_one_winner() {
        let dir = TempDir::new().unwrap();
        let path = fake_device(&dir, "ttySL0");
        let lock = Arc::new(DeviceLock::new(path.clone()));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || lock.acquire(&format!("site-{i}")).is_ok())
            })
            .collect();
        let wins: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);

        lock.release(&path);
        assert!(lock.acquire("after").is_ok());
    }

    #[test]
    fn pool_hands_out_distinct_devices() {
        let dir = TempDir::new().unwrap();
        let a = fake_device(&dir, "ttyIAX0");
        let b = fake_device(&dir, "ttyIAX1");
        let pool = DevicePool::from_paths([a.clone(), b.clone()]);

        let first = pool.acquire("site-a").unwrap();
        let second = pool.acquire("site-b").unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            pool.acquire("site-c").unwrap_err(),
            ArbiterError::DeviceMissing
        ));

        pool.release(&first);
        let third = pool.acquire("site-a").unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn pool_prunes_missing_devices() {
        let dir = TempDir::new().unwrap();
        let real = fake_device(&dir, "ttyREAL");
        let gone = dir.path().join("ttyGONE");
        let pool = DevicePool::from_paths([gone.clone(), real.clone()]);

        let acquired = pool.acquire("test").unwrap();
        assert_eq!(acquired, real);

        // The vanished node is out of the mapping and the real one is held.
        assert!(matches!(
            pool.acquire("test2").unwrap_err(),
            ArbiterError::DeviceMissing
        ));
        assert_eq!(pool.available(), (0, 1));
    }

    #[test]
    fn pool_tracks_active_sites() {
        let dir = TempDir::new().unwrap();
        let a = fake_device(&dir, "ttyIAX0");
        let _b = fake_device(&dir, "ttyIAX1");
        let pool = DevicePool::from_paths([a.clone(), _b.clone()]);

        pool.acquire("site-a").unwrap();
        pool.acquire("site-b").unwrap();
        let active = pool.active_sites();
        assert!(active.contains("site-a"));
        assert!(active.contains("site-b"));

        pool.release(&a);
        assert_eq!(pool.active_sites().len(), 1);
    }

    #[test]
    fn probe_skips_missing_nodes() {
        let dir = TempDir::new().unwrap();
        fake_device(&dir, "ttyIAX0");
        fake_device(&dir, "ttyIAX2");
        let prefix = dir.path().join("ttyIAX");
        let pool = DevicePool::probe(prefix.to_str().unwrap(), 4);
        assert_eq!(pool.available(), (2, 2));
    }
}
