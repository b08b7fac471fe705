//! Parameter-keyed result caching.
//!
//! Results are keyed by a [`CanonicalKey`] derived from a path's identity and
//! the Setting/Variable values of the environments it reads. Options never
//! participate. Entries live in a [`ResultStore`]; the [`LookupCache`] is the
//! single gateway that derives keys and reads or writes entries.
//!
//! Backends:
//! - [`MemoryStore`]: process-local, for tests and throwaway journeys
//! - [`RedbStore`]: `<dir>/results.redb`, single host
//! - [`FsStore`]: one file per entry, safe for concurrent processes

mod entry;
mod fs_store;
mod key;
mod lookup;
mod redb_store;
mod store;

pub use entry::{EnvSnapshot, Entry, PriorRun, RECORD_FORMAT};
pub use fs_store::FsStore;
pub use key::{CanonicalKey, KEY_SCHEME_VERSION, KeyParseError};
pub use lookup::LookupCache;
pub(crate) use lookup::translate as translate_store_error;
pub use redb_store::RedbStore;
pub use store::{DEFAULT_HISTORY_LIMIT, EntryIter, MemoryStore, ResultStore, StoreStats};
