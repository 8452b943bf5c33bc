//! Store and unit of work for keel.
//!
//! `keel-store` is the **unit-of-work layer**. It coordinates object identity,
//! change tracking and transactional persistence over one synchronous
//! [`Connection`](keel_core::Connection).
//!
//! # Role In The Architecture
//!
//! - **Identity map**: at most one live object per (entity, primary key) per
//!   [`Store`]; loading the same key again returns the same [`ObjectId`].
//! - **Change tracking**: every object keeps a committed and a pending row of
//!   variables; the difference is what the next flush writes.
//! - **Ordered flush**: inserts, updates and deletes are topologically
//!   ordered over foreign-key links and explicit hints; a cycle through a
//!   nullable key is broken with a follow-up UPDATE.
//! - **Transactions**: a flush that fails part-way restores the in-memory
//!   state it started from; `rollback` returns every object to its last
//!   committed state.
//!
//! # Example
//!
//! ```ignore
//! let mut store = Store::new(conn, registry, StoreConfig::default());
//!
//! // New objects are INSERTed on flush
//! let ada = store.add(store.object("person")?.with("name", "Ada")?)?;
//!
//! // Key lookups hit the identity map first
//! let same = store.get("person", &[Value::Int(1)])?;
//!
//! // Mark for deletion, then write everything
//! store.remove(ada)?;
//! store.commit()?;
//! ```

pub mod arena;
pub mod attr;
pub mod config;
pub mod flush;
pub mod identity_map;
mod matcher;
pub mod object;
pub mod reference;
pub mod result_set;
pub mod store;

#[cfg(test)]
mod mock;

pub use arena::{ObjectId, StoreId};
pub use attr::{Attr, TypedObject};
pub use config::StoreConfig;
pub use flush::{FlushPlan, FlushStep, OpKind};
pub use identity_map::{IdentityKey, IdentityMap};
pub use object::{Object, ObjectInfo, ObjectState};
pub use result_set::{ResultSet, TableSet, TupleResultSet};
pub use store::{FlushReport, PendingCounts, Store, TxState};
