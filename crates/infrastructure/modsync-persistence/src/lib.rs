//! The State Store: exclusive owner of the persistent state document.
//! Every mutation in the daemon flows through [`StateStore::update`], which
//! is serialized and durable.

mod error;
mod file_store;

pub use error::{StoreError, StoreErrorKind};
pub use file_store::{load_document, save_atomic, FileStore};

use modsync_core::State;

pub trait StateStore: Send + Sync {
    /// Current durable state; a missing document is the empty one.
    fn load(&self) -> Result<State, StoreError>;

    /// Persist the given document atomically.
    fn save(&self, state: &State) -> Result<(), StoreError>;

    /// Run `mutator` against the latest durable state under the store lock
    /// and persist the result. A mutator error aborts the update with no
    /// write. Returns a copy of the state as persisted.
    fn update(
        &self,
        mutator: &mut dyn FnMut(&mut State) -> Result<(), StoreError>,
    ) -> Result<State, StoreError>;
}
