use crate::auth::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Process-wide default vector dimension. Must match the embedding provider;
/// mismatches fail fast at ingest.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;

/// Chunk metadata keys shared between the ingestion side (which writes them)
/// and the retrieval side (which filters on them).
pub const INJECTION_RISK_KEY: &str = "injection_risk";
pub const INJECTION_SIGNALS_KEY: &str = "injection_signals";
pub const DOCUMENT_TITLE_KEY: &str = "document_title";

pub fn generate_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(WorkspaceId);
string_id!(DocumentId);
string_id!(ChunkId);
string_id!(UserId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Private,
    OrgRead,
    Shared,
}

/// Per-workspace allow-list layered on top of visibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceAcl {
    #[serde(default)]
    pub allowed_user_ids: Vec<UserId>,
    #[serde(default)]
    pub allowed_roles: Vec<Role>,
}

impl WorkspaceAcl {
    pub fn allows(&self, user_id: &UserId, role: Role) -> bool {
        self.allowed_user_ids.contains(user_id) || self.allowed_roles.contains(&role)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub visibility: Visibility,
    pub owner_user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<WorkspaceAcl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, owner_user_id: UserId) -> Self {
        Self {
            id: WorkspaceId::generate(),
            name: name.into(),
            visibility: Visibility::Private,
            owner_user_id,
            acl: None,
            archived_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_acl(mut self, acl: WorkspaceAcl) -> Self {
        self.acl = Some(acl);
        self
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn archive(&mut self) {
        if self.archived_at.is_none() {
            self.archived_at = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Ready => "READY",
            DocumentStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub uploaded_by_user_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(
        workspace_id: WorkspaceId,
        title: impl Into<String>,
        uploaded_by_user_id: UserId,
    ) -> Self {
        Self {
            id: DocumentId::generate(),
            workspace_id,
            title: title.into(),
            file_name: None,
            mime_type: None,
            storage_key: None,
            status: DocumentStatus::Pending,
            error_message: None,
            uploaded_by_user_id,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn with_file(
        mut self,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        self.storage_key = Some(storage_key(&self.id, &file_name));
        self.file_name = Some(file_name);
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Both storage_key and mime_type must be present before a document may
    /// enter PROCESSING.
    pub fn has_file_metadata(&self) -> bool {
        self.storage_key.is_some() && self.mime_type.is_some()
    }
}

/// Blob key layout: the document row is the authoritative index, the blob is
/// content.
pub fn storage_key(document_id: &DocumentId, file_name: &str) -> String {
    format!("documents/{}/{}", document_id, file_name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub chunk_index: u32,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    pub fn new(document_id: DocumentId, chunk_index: u32, content: impl Into<String>) -> Self {
        Self {
            id: ChunkId::generate(),
            document_id,
            chunk_index,
            content: content.into(),
            embedding: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A chunk returned by retrieval, with its similarity score and the owning
/// document's title for citation rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub document_title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_follows_blob_layout() {
        let id = DocumentId::from("doc-1");
        assert_eq!(storage_key(&id, "policy.pdf"), "documents/doc-1/policy.pdf");
    }

    #[test]
    fn with_file_sets_metadata_required_for_processing() {
        let doc = Document::new(WorkspaceId::from("w1"), "Policy", UserId::from("u1"));
        assert!(!doc.has_file_metadata());

        let doc = doc.with_file("policy.pdf", "application/pdf");
        assert!(doc.has_file_metadata());
        assert_eq!(
            doc.storage_key.as_deref(),
            Some(format!("documents/{}/policy.pdf", doc.id).as_str())
        );
    }

    #[test]
    fn acl_allows_by_user_or_role() {
        let acl = WorkspaceAcl {
            allowed_user_ids: vec![UserId::from("u2")],
            allowed_roles: vec![Role::Viewer],
        };
        assert!(acl.allows(&UserId::from("u2"), Role::Member));
        assert!(acl.allows(&UserId::from("u9"), Role::Viewer));
        assert!(!acl.allows(&UserId::from("u9"), Role::Member));
    }
}
