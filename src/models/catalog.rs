//! Resource tree: Model → Instance → Sample, plus the per-instance tags and
//! descriptors the merge engine operates on.
//!
//! Blob payloads are referenced by an opaque handle issued by the blob store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque key returned by `BlobStore::put`.
pub type BlobHandle = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Model {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub model_id: Uuid,
    pub name: String,
    pub description: String,
    pub finalized: bool,
    /// Set once this instance has been folded into another. Terminal.
    pub merged_into: Option<Uuid>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sample {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub finalized: bool,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SampleData {
    pub id: Uuid,
    pub sample_id: Uuid,
    pub key: String,
    pub file: Option<BlobHandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SampleLabel {
    pub id: Uuid,
    pub sample_id: Uuid,
    pub key: String,
    pub file: Option<BlobHandle>,
    /// Fixed at creation: false when the sample was already finalized.
    pub mergeable: bool,
}

/// A tag name, unique within its instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub name: String,
}

/// Sample ↔ tag association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SampleTag {
    pub sample_id: Uuid,
    pub tag_id: Uuid,
    /// Fixed at creation: false when the sample was already finalized.
    pub mergeable: bool,
}

/// A (key, optional file) pair. Keys repeat to express multiple values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Descriptor {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub key: String,
    pub file: Option<BlobHandle>,
}
