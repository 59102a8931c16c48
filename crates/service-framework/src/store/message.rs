//! # Store Messages
//!
//! Requests exchanged between a [`StoreClient`](super::client::StoreClient)
//! and the task that owns a collection.
//!
//! Each variant maps to one operation of the
//! [`StoreAdapter`](super::adapter::StoreAdapter) boundary and carries a
//! oneshot sender for its reply, so the owning task processes requests one at
//! a time and never shares its records.

use super::adapter::{Filter, Record};
use crate::error::StoreError;
use tokio::sync::oneshot;

/// One-shot reply channel used by the store task.
pub type Response<T> = oneshot::Sender<Result<T, StoreError>>;

#[derive(Debug)]
pub enum StoreRequest {
    Ping {
        respond_to: Response<()>,
    },
    Count {
        query: Record,
        respond_to: Response<usize>,
    },
    Find {
        filter: Filter,
        respond_to: Response<Vec<Record>>,
    },
    FindById {
        id: String,
        respond_to: Response<Option<Record>>,
    },
    Insert {
        record: Record,
        respond_to: Response<Record>,
    },
    InsertMany {
        records: Vec<Record>,
        respond_to: Response<Vec<Record>>,
    },
    Update {
        id: String,
        patch: Record,
        respond_to: Response<Option<Record>>,
    },
    Remove {
        id: String,
        respond_to: Response<Option<Record>>,
    },
}

impl StoreRequest {
    /// Operation name used in logs and mock diagnostics.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "connect",
            Self::Count { .. } => "count",
            Self::Find { .. } => "find",
            Self::FindById { .. } => "find_by_id",
            Self::Insert { .. } => "insert",
            Self::InsertMany { .. } => "insert_many",
            Self::Update { .. } => "update_by_id",
            Self::Remove { .. } => "remove_by_id",
        }
    }
}
