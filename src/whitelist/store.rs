//! Persistent allow-list cache using heed (LMDB).
//!
//! Keeps the last fetched allow-list snapshot, so a restarted daemon can still
//! validate devices while the remote service is unreachable, and the bounded
//! log of foreign-capture occurrences.

use std::{
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use log::debug;

use crate::{
   bluetooth::guard::CaptureRecord,
   error::{LinkError, Result},
   whitelist::validator::Snapshot,
};

const SNAPSHOT_KEY: &str = "whitelist";
const CAPTURES_KEY: &str = "recent";

struct Db {
   env: Env,
   snapshots: Database<Str, SerdeBincode<Snapshot>>,
   captures: Database<Str, SerdeBincode<Vec<CaptureRecord>>>,
}

/// Thread-safe handle to the store.
#[derive(Clone)]
pub struct WhitelistStore {
   db: Arc<Db>,
}

impl WhitelistStore {
   /// Open or create the store at its default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(2)
            .open(path)?
      };

      let mut wtxn = env.write_txn()?;
      let snapshots = env.create_database(&mut wtxn, Some("snapshots"))?;
      let captures = env.create_database(&mut wtxn, Some("captures"))?;
      wtxn.commit()?;

      debug!("Opened whitelist store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db {
            env,
            snapshots,
            captures,
         }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("SLEEPLINK_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/sleeplink/whitelist.db
      let base = dirs::data_local_dir().ok_or(LinkError::DataDirectoryNotFound)?;
      Ok(base.join("sleeplink").join("whitelist.db"))
   }

   pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
      let rtxn = self.db.env.read_txn()?;
      Ok(self.db.snapshots.get(&rtxn, SNAPSHOT_KEY)?)
   }

   pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self.db.snapshots.put(&mut wtxn, SNAPSHOT_KEY, snapshot)?;
      wtxn.commit()?;
      Ok(())
   }

   pub fn load_captures(&self) -> Result<Vec<CaptureRecord>> {
      let rtxn = self.db.env.read_txn()?;
      Ok(self
         .db
         .captures
         .get(&rtxn, CAPTURES_KEY)?
         .unwrap_or_default())
   }

   pub fn save_captures(&self, records: &[CaptureRecord]) -> Result<()> {
      let mut wtxn = self.db.env.write_txn()?;
      self
         .db
         .captures
         .put(&mut wtxn, CAPTURES_KEY, &records.to_vec())?;
      wtxn.commit()?;
      Ok(())
   }
}
