//! condb Storage - Cascade, Caches and Query Resolution
//!
//! Everything that talks to a backend: the prioritised cascade of
//! connections and its sequence number allocation, the per-table proxy that
//! builds validity and data SQL, the resolver that folds validity records
//! into an effective window, the in-memory result cache, the optional LMDB
//! backed L2 cache, and the manager tying them together.

pub mod accessor;
pub mod backend;
pub mod cache;
pub mod cascade;
pub mod connection;
pub mod l2;
pub mod manager;
pub mod proxy;
pub mod resolver;
pub mod result;
pub mod row;
pub mod seqno;
pub mod statement;

pub use accessor::{sql_qualifiers, QueryServices, TableAccessor};
pub use backend::{Backend, BackendFactory, RowSet, SqlValue, SqliteBackend, SqliteFactory};
pub use cache::{CacheStats, ResultCache};
pub use cascade::{
    vld_table_ddl, Cascade, ConnectionMaintainer, TableLock, GLOBAL_SEQNO_TABLE, LOCAL_SEQNO_TABLE,
    STATE_FLAGS_TABLE,
};
pub use connection::Connection;
pub use l2::{L2Cache, L2Entry};
pub use manager::{AnyAccessor, DbiManager};
pub use proxy::DbProxy;
pub use resolver::{FoldStats, ValidityResolver};
pub use result::{AggregatedResult, QueryResult, ResultCore, ResultHandle, SimplePayload, SimpleResult};
pub use row::{read_validity_record, read_validity_records, RowReader, TableRow};
pub use seqno::SeqNoRequest;
pub use statement::Statement;
