//! Durable local state: the replicated log and the metadata store.

mod log;
mod meta;

pub use self::log::LogStore;
pub use self::meta::MetaStore;
pub use self::meta::KEY_COMMIT_INDEX;
pub use self::meta::KEY_CURRENT_TERM;
pub use self::meta::KEY_VOTED_FOR;

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::state_machine::StateMachine;

/// The storage owned by one replica: its log, its metadata and its state
/// machine. Never shared between replicas.
pub struct ReplicaStore {
    pub log: Arc<LogStore>,
    pub meta: Arc<MetaStore>,
    pub state_machine: Arc<Mutex<dyn StateMachine>>,
}

impl ReplicaStore {
    /// Open (or create) the durable stores under the given paths.
    pub fn open(
        store_dir: &Path,
        db_path: &Path,
        state_machine: Arc<Mutex<dyn StateMachine>>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            log: Arc::new(LogStore::open(store_dir)?),
            meta: Arc::new(MetaStore::open(db_path)?),
            state_machine,
        })
    }
}
