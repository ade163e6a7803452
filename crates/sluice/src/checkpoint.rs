//! Durable transaction-id checkpoint
//!
//! A single transaction id persisted as plain text. The file is replaced by
//! writing a `.tmp` sibling, syncing it and renaming it over the final path;
//! the rename is the commit point, so a crashed write never yields a torn
//! file. The file is rewritten at most once per committed transaction.

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::gtid::Gtid;

const TMP_SUFFIX: &str = "tmp";

/// The persisted last-committed transaction id.
pub struct GtidStateFile {
    path: PathBuf,
}

impl GtidStateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpointed id. An absent or empty file means no
    /// checkpoint; any other read failure is fatal to startup.
    pub async fn load(&self) -> Result<Option<Gtid>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Checkpoint(e)),
        };

        match contents.split_whitespace().next() {
            Some(token) => Ok(Some(token.parse()?)),
            None => Ok(None),
        }
    }

    /// Replace the checkpoint with `gtid` via the atomic-rename protocol.
    pub async fn save(&self, gtid: &Gtid) -> Result<()> {
        let tmp = self.tmp_path();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await
            .map_err(Error::Checkpoint)?;

        file.write_all(format!("{gtid}\n").as_bytes())
            .await
            .map_err(Error::Checkpoint)?;
        file.sync_all().await.map_err(Error::Checkpoint)?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(Error::Checkpoint)?;

        debug!("Saved GTID state '{}' to {}", gtid, self.path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".");
        name.push(TMP_SUFFIX);
        PathBuf::from(name)
    }
}
