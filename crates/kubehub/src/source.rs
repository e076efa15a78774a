use async_trait::async_trait;
use corral_core::{CorralResult, ObjectKey, ObjectRecord, ResourceVersion};
use futures::stream::BoxStream;

/// Full snapshot of a collection plus the cursor to watch from.
#[derive(Debug, Clone)]
pub struct Listing {
    pub items: Vec<ObjectRecord>,
    pub resource_version: ResourceVersion,
}

/// One item of a watch stream, before store normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ObjectRecord),
    Modified(ObjectRecord),
    Deleted(ObjectRecord),
    /// Cursor advance with no object change.
    Bookmark(ResourceVersion),
}

impl WatchEvent {
    pub fn resource_version(&self) -> ResourceVersion {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r.resource_version,
            WatchEvent::Bookmark(rv) => *rv,
        }
    }
}

/// Lazy, possibly endless change stream. An `Err` item ends the stream.
pub type WatchStream = BoxStream<'static, CorralResult<WatchEvent>>;

/// List-then-watch access to one remote collection.
#[async_trait]
pub trait ListWatcher: Send + Sync {
    /// Kind of every object this collection yields.
    fn kind(&self) -> &str;

    async fn list(&self) -> CorralResult<Listing>;

    /// Open a watch from `since`. Fails with `ResourceExpired` when the
    /// remote side no longer retains history that far back.
    async fn watch(&self, since: ResourceVersion) -> CorralResult<WatchStream>;
}

/// A conditional mutation of one remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub key: ObjectKey,
    /// Full desired object, including `metadata`.
    pub body: serde_json::Value,
    /// Version the caller read; a mismatch is a `Conflict`.
    pub expected_version: Option<ResourceVersion>,
    /// Lease fencing token of the writer, if leader-elected.
    pub fencing_token: Option<u64>,
}

#[async_trait]
pub trait RemoteWriter: Send + Sync {
    /// Returns the version assigned to the written object.
    async fn write(&self, req: WriteRequest) -> CorralResult<ResourceVersion>;
}
