use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{TokenError, TokenResult};

pub fn ensure_secure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn open_secure(path: &Path, options: &mut OpenOptions) -> io::Result<File> {
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    options.open(path)
}

fn ensure_file_permissions(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    let _ = path;
    Ok(())
}

/// Write `value` as JSON next to `path`, then move it into place so readers
/// never observe a torn record.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> TokenResult<()> {
    let staging = path.with_extension("json.tmp");
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    let file = open_secure(&staging, &mut options).map_err(TokenError::device)?;
    FileExt::lock_exclusive(&file).map_err(TokenError::device)?;
    serde_json::to_writer_pretty(BufWriter::new(&file), value).map_err(TokenError::device)?;
    file.sync_all().map_err(TokenError::device)?;
    FileExt::unlock(&file).map_err(TokenError::device)?;
    fs::rename(&staging, path).map_err(TokenError::device)
}

/// Read a JSON record. A missing file yields `None`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> TokenResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    ensure_file_permissions(path).map_err(TokenError::device)?;
    let file = File::open(path).map_err(TokenError::device)?;
    FileExt::lock_shared(&file).map_err(TokenError::device)?;
    let record = serde_json::from_reader(BufReader::new(&file)).map_err(TokenError::device)?;
    FileExt::unlock(&file).map_err(TokenError::device)?;
    Ok(Some(record))
}

pub fn remove_if_exists(path: &Path) -> TokenResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(TokenError::device(err)),
    }
}
