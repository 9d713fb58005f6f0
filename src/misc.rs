// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

/// Read a single whitespace-trimmed value from a sysfs-style file.
pub fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open or read file {:?}", path))?;
    val.trim()
        .parse::<T>()
        .map_err(|e| anyhow!("Failed to parse {:?}: {}", path, e))
}
