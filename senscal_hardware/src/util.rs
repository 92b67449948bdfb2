use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{HwError, Result};

/// Replace `path` with `bytes` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("new");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)?;
    Ok(())
}

/// Read a sysfs-style attribute and parse its trimmed content.
pub fn read_attr<T: std::str::FromStr>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    let value = raw.trim();
    value.parse().map_err(|_| HwError::Parse {
        path: path.to_path_buf(),
        value: value.to_owned(),
    })
}
