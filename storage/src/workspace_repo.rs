use crate::document_repo::RepoError;
use async_trait::async_trait;
use atalaya_core::model::{Visibility, Workspace, WorkspaceAcl, WorkspaceId};

#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn save_workspace(&self, workspace: Workspace) -> Result<(), RepoError>;

    async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, RepoError>;

    /// Archived workspaces are excluded from default listings.
    async fn list_workspaces(&self, include_archived: bool) -> Result<Vec<Workspace>, RepoError>;

    async fn publish_workspace(
        &self,
        id: &WorkspaceId,
        visibility: Visibility,
    ) -> Result<(), RepoError>;

    async fn share_workspace(&self, id: &WorkspaceId, acl: WorkspaceAcl) -> Result<(), RepoError>;

    async fn archive_workspace(&self, id: &WorkspaceId) -> Result<(), RepoError>;
}
