//! Owner-only file helpers for secrets and stranded payloads.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::warn;

/// Create `dir` (and parents) and restrict it to the owning user.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", dir.display(), e);
        }
    }
    Ok(())
}

fn private_options() -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts
}

/// Create a brand new 0600 file. Fails with `AlreadyExists` instead of
/// truncating an existing one.
pub fn create_private_new(path: &Path) -> io::Result<File> {
    private_options().create_new(true).open(path)
}

/// Atomically replace `path` with `bytes` (temp file + rename), 0600.
pub fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = private_options().create(true).truncate(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
