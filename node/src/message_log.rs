use std::path::Path;

use chrono::{DateTime, Utc};
use peercoord_p2p::{LogError, MessageLog};
use sled::{Db, Tree};

/// Durable log of received direct messages, one sled tree per node and hour.
///
/// The tree is named `<peer id><YYMMDDHH>` after the hour the log was opened.
/// Keys are monotonically increasing ids, so iteration returns entries in
/// append order.
pub struct SledMessageLog {
    db: Db,
    tree: Tree,
    name: String,
}

impl SledMessageLog {
    pub fn open<P: AsRef<Path>>(path: P, peer_id: &str) -> sled::Result<Self> {
        Self::open_at(path, peer_id, Utc::now())
    }

    fn open_at<P: AsRef<Path>>(path: P, peer_id: &str, opened: DateTime<Utc>) -> sled::Result<Self> {
        let db = sled::open(path)?;
        let name = format!("{peer_id}{}", opened.format("%y%m%d%H"));
        let tree = db.open_tree(&name)?;
        Ok(Self { db, tree, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flush(&self) -> sled::Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl MessageLog for SledMessageLog {
    fn append(&self, entry: &[u8]) -> Result<(), LogError> {
        let id = self.db.generate_id().map_err(to_log_error)?;
        self.tree
            .insert(id.to_be_bytes(), entry)
            .map_err(to_log_error)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<Vec<u8>>, LogError> {
        self.tree
            .iter()
            .values()
            .map(|value| value.map(|v| v.to_vec()).map_err(to_log_error))
            .collect()
    }
}

fn to_log_error(err: sled::Error) -> LogError {
    LogError(err.to_string())
}
