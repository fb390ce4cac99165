use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::errors::{Error, Result};

/// Cross-process mutex for one user and one purpose, backed by a lock file
/// in the state directory. A second acquirer within the TTL observes
/// `Error::Lock` and skips its cycle; a file older than the TTL is treated
/// as left behind by a dead process and taken over.
#[derive(Debug)]
pub struct UserLock {
    path: PathBuf,
}

const LOCK_TTL_SECS: u64 = 600;

impl UserLock {
    pub fn acquire(state_dir: &Path, user: &str, name: &str) -> Result<UserLock> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("{}.{}.lock", sanitize(user), name));

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if lock_age_secs(&path).map_or(true, |age| age < LOCK_TTL_SECS) {
                    return Err(Error::Lock(format!("{} already locked", path.display())));
                }
                warn!(lock = %path.display(), "taking over stale lock");
            }
            Err(e) => return Err(e.into()),
        }

        let stamp = format!(
            "{} {}",
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        );
        fs::write(&path, stamp)?;
        Ok(UserLock { path })
    }
}

impl Drop for UserLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

fn lock_age_secs(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok().map(|d| d.as_secs())
}

fn sanitize(user: &str) -> String {
    user.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
