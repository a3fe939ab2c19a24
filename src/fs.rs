// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Mode applied to private keys and bundles.
pub const SECRET_MODE: u32 = 0o600;

/// Mode applied to a newly created key directory.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

const LOCK_RETRY_DELAY_MS: u64 = 50;

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))
}

/// Hidden sibling of `path` for staging writes.
///
/// Lives in the same directory so the final rename stays on one filesystem.
pub fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?
        .to_string_lossy();
    let random_suffix: u64 = rand::Rng::random(&mut rand::rng());
    Ok(parent.join(format!(".{}.tmp-{:x}", name, random_suffix)))
}

/// Move a staged file into place. The staged file is removed if the rename fails.
pub fn persist(temp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(temp_path, path).map_err(|e| {
        discard(temp_path);
        Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Best-effort removal of a staged file.
pub fn discard(temp_path: &Path) {
    if temp_path.exists() {
        if let Err(e) = fs::remove_file(temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %e, "failed to remove temp file");
        }
    }
}

/// Atomically write data to a file using a temporary file and rename.
/// Readers never observe a partially written file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let temp_path = temp_sibling(path)?;

    let write = || -> Result<()> {
        let mut file = File::create(&temp_path).map_err(|e| Error::WriteFile {
            path: temp_path.clone(),
            source: e,
        })?;
        file.write_all(contents).map_err(|e| Error::WriteFile {
            path: temp_path.clone(),
            source: e,
        })?;
        file.sync_all().map_err(|e| Error::WriteFile {
            path: temp_path.clone(),
            source: e,
        })
    };

    if let Err(e) = write() {
        discard(&temp_path);
        return Err(e);
    }

    persist(&temp_path, path)
}

/// Atomically write a secret file, created with owner-only permissions from the start.
pub fn atomic_write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = temp_sibling(path)?;

    if let Err(e) = write_secret_file(&temp_path, contents) {
        discard(&temp_path);
        return Err(e);
    }

    persist(&temp_path, path)
}

#[cfg(unix)]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(SECRET_MODE)
        .open(path)
        .map_err(|e| Error::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })?;

    file.write_all(contents).map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    file.sync_all().map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

#[cfg(not(unix))]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read a file, returning `None` when it does not exist.
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::ReadFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Create `dir` and its parents. `mode` is applied only when the directory is new.
pub fn ensure_dir(dir: &Path, mode: Option<u32>) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|e| Error::CreateDir {
        path: dir.to_path_buf(),
        source: e,
    })?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(mode)).map_err(|e| {
            Error::Permissions {
                path: dir.to_path_buf(),
                source: e,
            }
        })?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Owner and group names to enforce on sensitive files. `None` leaves that part alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub owner: Option<String>,
    pub group: Option<String>,
}

impl Ownership {
    pub fn new(owner: Option<String>, group: Option<String>) -> Self {
        Self { owner, group }
    }

    /// Leave ownership untouched; only the mode is enforced.
    pub fn unchanged() -> Self {
        Self::default()
    }

    #[cfg(unix)]
    fn resolve(&self) -> Result<(Option<u32>, Option<u32>)> {
        use nix::unistd::{Group, User};

        let uid = match &self.owner {
            Some(name) => Some(
                User::from_name(name)
                    .ok()
                    .flatten()
                    .ok_or_else(|| Error::UnknownUser(name.clone()))?
                    .uid
                    .as_raw(),
            ),
            None => None,
        };
        let gid = match &self.group {
            Some(name) => Some(
                Group::from_name(name)
                    .ok()
                    .flatten()
                    .ok_or_else(|| Error::UnknownGroup(name.clone()))?
                    .gid
                    .as_raw(),
            ),
            None => None,
        };
        Ok((uid, gid))
    }
}

/// Make `path` carry exactly `mode` and the requested ownership.
///
/// Returns `Ok(false)` without touching the file when it already complies.
#[cfg(unix)]
pub fn enforce_mode_and_owner(path: &Path, mode: u32, ownership: &Ownership) -> Result<bool> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let metadata = fs::metadata(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let (uid, gid) = ownership.resolve()?;

    let mut changed = false;

    let wrong_uid = uid.filter(|uid| *uid != metadata.uid());
    let wrong_gid = gid.filter(|gid| *gid != metadata.gid());
    if wrong_uid.is_some() || wrong_gid.is_some() {
        std::os::unix::fs::chown(path, wrong_uid, wrong_gid).map_err(|e| Error::Ownership {
            path: path.to_path_buf(),
            source: e,
        })?;
        changed = true;
    }

    if metadata.mode() & 0o7777 != mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            Error::Permissions {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        changed = true;
    }

    Ok(changed)
}

#[cfg(not(unix))]
pub fn enforce_mode_and_owner(path: &Path, _mode: u32, _ownership: &Ownership) -> Result<bool> {
    if !path.exists() {
        return Err(Error::ReadFile {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "File not found"),
        });
    }
    Ok(false)
}

/// Exclusive advisory lock serializing runs for one identity.
///
/// Released when dropped.
#[derive(Debug)]
pub struct IdentityLock {
    file: File,
    path: PathBuf,
}

impl IdentityLock {
    /// Wait up to `timeout` for the lock at `path`, creating the file if needed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| Error::Lock {
                path: path.to_path_buf(),
                source: e,
            })?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if start.elapsed() >= timeout {
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_DELAY_MS));
                }
                Err(e) => {
                    return Err(Error::Lock {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
