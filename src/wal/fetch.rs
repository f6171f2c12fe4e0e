//! `wal-fetch`: restore one archived WAL file into place.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use anyhow::Context;
use tracing::info;

use crate::storage::{download_and_decompress, Folder};
use crate::Result;

const TEMP_SUFFIX: &str = ".pgdelta-tmp";

/// Download `wal_name` from the WAL folder into `destination`.
///
/// The data lands in a temporary sibling first and is renamed over the
/// destination once complete, so the server never sees a half-written file.
/// A missing object is reported as `Error::ObjectNotFound`.
pub fn fetch_wal_file(folder: &dyn Folder, wal_name: &str, destination: &Path) -> Result<u64> {
    let mut reader = download_and_decompress(folder, wal_name)?;
    let mut temp = destination.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = Path::new(&temp);

    let written = (|| -> Result<u64> {
        let mut file = File::create(temp).with_context(|| format!("creating {}", temp.display()))?;
        let written = io::copy(&mut reader, &mut file).with_context(|| format!("downloading {wal_name}"))?;
        file.flush()?;
        file.sync_all()?;
        Ok(written)
    })();
    let written = match written {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(temp);
            return Err(e);
        }
    };
    fs::rename(temp, destination).with_context(|| format!("moving {wal_name} into {}", destination.display()))?;
    info!(wal = %wal_name, destination = %destination.display(), bytes = written, "wal_file_fetched");
    Ok(written)
}
