//! Output root management and batch counters.
//!
//! Mounting a removable device before serving the directory is kept as
//! explicit, possibly-no-op `mount`/`umount` operations rather than hiding
//! a shell-out behind a property getter.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{CoreError, CoreResult};

/// Filename pattern produced by a batch/cycle: `b{batch:06}_s{seq:06}.pico`,
/// optionally suffixed `_light`/`_dark`.
fn parse_batch_number(file_name: &str) -> Option<u32> {
    let stem = file_name.split('_').next()?;
    let digits = stem.strip_prefix('b')?;
    digits.parse::<u32>().ok()
}

/// Where/how to mount the removable device backing the data directory, or
/// `None` for a plain local path.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

/// Manages one output root: directory creation/writability checks, optional
/// mount/unmount, file listing, and the per-subdirectory batch counter.
pub struct DataDir {
    root: PathBuf,
    mount: Option<MountConfig>,
}

impl DataDir {
    /// `datadir` is resolved relative to the mount point (if `mount` is
    /// set) or the current working directory, for non-absolute paths.
    pub fn new(datadir: impl AsRef<Path>, mount: Option<MountConfig>) -> CoreResult<Self> {
        let datadir = datadir.as_ref();
        let root = match &mount {
            Some(m) if !datadir.is_absolute() => m.mount_point.join(datadir),
            _ if datadir.is_absolute() => datadir.to_path_buf(),
            _ => std::env::current_dir()
                .map_err(|e| CoreError::DataDir(e.to_string()))?
                .join(datadir),
        };
        info!("initialising data directory {}", root.display());
        Ok(DataDir { root, mount })
    }

    /// Ensure the directory exists and is writable, creating it if
    /// necessary. A missing or unwritable data directory is the one fatal
    /// startup error this crate raises.
    pub fn datadir(&self) -> CoreResult<&Path> {
        if let Some(m) = &self.mount {
            if !self.is_mounted(m)? {
                return Err(CoreError::DataDir(format!(
                    "{} not mounted at {}",
                    m.device.display(),
                    m.mount_point.display()
                )));
            }
        }
        if !self.root.exists() {
            info!("creating data directory {}", self.root.display());
            fs::create_dir_all(&self.root).map_err(|e| CoreError::DataDir(e.to_string()))?;
        }
        let meta = fs::metadata(&self.root).map_err(|e| CoreError::DataDir(e.to_string()))?;
        if !meta.is_dir() {
            return Err(CoreError::DataDir(format!("{} is not a directory", self.root.display())));
        }
        if meta.permissions().readonly() {
            return Err(CoreError::DataDir(format!("cannot write to {}", self.root.display())));
        }
        Ok(&self.root)
    }

    /// `true` if the configured device is mounted at the configured mount
    /// point; `false` if there's no mount configuration at all (platforms
    /// without removable storage treat mount/unmount as no-ops).
    pub fn is_mounted(&self, m: &MountConfig) -> CoreResult<bool> {
        let mounts = match fs::read_to_string("/proc/mounts") {
            Ok(s) => s,
            Err(_) => return Ok(true), // no /proc/mounts (e.g. non-Linux): treat as a no-op success
        };
        let device = m.device.to_string_lossy();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let Some(dev) = fields.next() else { continue };
            if dev == device {
                let mount_point = fields.next().unwrap_or("");
                if mount_point == m.mount_point.to_string_lossy() {
                    return Ok(true);
                }
                return Err(CoreError::DataDir(format!(
                    "device {dev} mounted in wrong directory {mount_point}"
                )));
            }
        }
        Ok(false)
    }

    /// Mount the configured device. No-op if no mount configuration was
    /// given.
    pub fn mount(&self) -> CoreResult<()> {
        let Some(m) = &self.mount else { return Ok(()) };
        if self.is_mounted(m)? {
            return Ok(());
        }
        info!("mounting {} at {}", m.device.display(), m.mount_point.display());
        let status = std::process::Command::new("mount")
            .arg(&m.device)
            .arg(&m.mount_point)
            .status()
            .map_err(|e| CoreError::DataDir(e.to_string()))?;
        if !status.success() {
            return Err(CoreError::DataDir(format!("mounting {} failed", m.device.display())));
        }
        Ok(())
    }

    /// Unmount the configured device. No-op if no mount configuration was
    /// given.
    pub fn umount(&self) -> CoreResult<()> {
        let Some(m) = &self.mount else { return Ok(()) };
        if !self.is_mounted(m)? {
            return Ok(());
        }
        info!("unmounting {}", m.device.display());
        let status = std::process::Command::new("umount")
            .arg(&m.device)
            .status()
            .map_err(|e| CoreError::DataDir(e.to_string()))?;
        if !status.success() {
            return Err(CoreError::DataDir(format!("unmounting {} failed", m.device.display())));
        }
        Ok(())
    }

    /// Join a (possibly relative) path onto the data directory.
    pub fn join(&self, relpath: impl AsRef<Path>) -> PathBuf {
        let relpath = relpath.as_ref();
        if relpath.is_absolute() {
            relpath.to_path_buf()
        } else {
            self.root.join(relpath)
        }
    }

    /// List files under `sub` matching `pattern` (a `*`/`?` glob over the
    /// file name only), sorted by ascending mtime, skipping the first `skip`
    /// entries. Paths are returned relative to the data directory.
    pub fn file_list(&self, sub: impl AsRef<Path>, pattern: &str, skip: usize) -> CoreResult<Vec<PathBuf>> {
        let dir = self.join(sub);
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(&dir).map_err(|e| CoreError::DataDir(e.to_string()))? {
                let entry = entry.map_err(|e| CoreError::DataDir(e.to_string()))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !glob_match(pattern, &name) {
                    continue;
                }
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                entries.push((entry.path(), mtime));
            }
        }
        entries.sort_by_key(|(_, mtime)| *mtime);
        let root = self.datadir()?.to_path_buf();
        Ok(entries
            .into_iter()
            .skip(skip)
            .map(|(p, _)| p.strip_prefix(&root).map(Path::to_path_buf).unwrap_or(p))
            .collect())
    }

    /// Compute the next batch counter for a subdirectory: `max(existing
    /// batch numbers) + 1`, or `0` if no file matches.
    pub fn next_counter(&self, sub: impl AsRef<Path> + Clone) -> CoreResult<u32> {
        let files = self.file_list(sub, "*.pico*", 0)?;
        let max = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(parse_batch_number)
            .max();
        Ok(match max {
            Some(m) => m + 1,
            None => 0,
        })
    }

    pub fn file_data(&self, relpath: impl AsRef<Path>) -> CoreResult<String> {
        fs::read_to_string(self.join(relpath)).map_err(CoreError::from)
    }
}

/// Minimal glob matcher supporting `*` and `?`, sufficient for the
/// `*.pico*` / `b{N:06d}_s{S:06d}.pico*` patterns this module needs.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn helper(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], n) || (!n.is_empty() && helper(p, &n[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &n[1..]),
            (Some(&pc), Some(&nc)) if pc == nc => helper(&p[1..], &n[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn counter_starts_at_zero_with_no_files() {
        let dir = tempdir().unwrap();
        let dd = DataDir::new(dir.path(), None).unwrap();
        dd.datadir().unwrap();
        assert_eq!(dd.next_counter("run1").unwrap(), 0);
    }

    #[test]
    fn counter_resumes_after_restart() {
        let dir = tempdir().unwrap();
        let dd = DataDir::new(dir.path(), None).unwrap();
        let sub = dd.join("run1");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("b000000_s000000.pico"), "{}").unwrap();
        fs::write(sub.join("b000000_s000001.pico"), "{}").unwrap();
        assert_eq!(dd.next_counter("run1").unwrap(), 1);
    }

    #[test]
    fn file_list_sorted_by_mtime_and_skip() {
        let dir = tempdir().unwrap();
        let dd = DataDir::new(dir.path(), None).unwrap();
        let sub = dd.join("run1");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("b000000_s000000.pico"), "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(sub.join("b000000_s000001.pico"), "b").unwrap();
        let all = dd.file_list("run1", "*.pico*", 0).unwrap();
        assert_eq!(all.len(), 2);
        let skipped = dd.file_list("run1", "*.pico*", 1).unwrap();
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn glob_matches_pico_suffixes() {
        assert!(glob_match("*.pico*", "b000000_s000000.pico_light"));
        assert!(glob_match("*.pico*", "b000000_s000000.pico"));
        assert!(!glob_match("*.pico*", "b000000_s000000.json"));
    }
}
