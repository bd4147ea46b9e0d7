#![doc = include_str!("RUSTDOC.md")]

pub mod compound_write;
pub mod error;
pub mod logger;
pub mod operation;
pub mod path;
pub mod persistence;
pub mod query;
pub mod repo;
pub mod server_values;
pub mod snapshot;
pub mod sync_point;
pub mod sync_tree;
pub mod tree;
pub mod util;
pub mod view;
pub mod write_tree;

#[doc(inline)]
pub use error::{DatabaseError, DatabaseErrorCode, DatabaseResult};

#[doc(inline)]
pub use path::Path;

#[doc(inline)]
pub use query::QuerySpec;

#[doc(inline)]
pub use repo::Repo;

#[doc(inline)]
pub use snapshot::Node;

#[doc(inline)]
pub use sync_tree::{ListenProvider, SyncTree};
