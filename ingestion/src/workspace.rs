use atalaya_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditRecorder};
use atalaya_core::auth::{Actor, WorkspacePolicy};
use atalaya_core::error::{CodedError, ServiceError};
use atalaya_core::model::{Visibility, Workspace, WorkspaceAcl, WorkspaceId};
use std::sync::Arc;
use storage::workspace_repo::WorkspaceRepository;

/// Workspace control-plane operations: create, publish, share, archive.
pub struct WorkspaceAdminService {
    workspaces: Arc<dyn WorkspaceRepository>,
    audit: AuditRecorder,
}

impl WorkspaceAdminService {
    pub fn new(workspaces: Arc<dyn WorkspaceRepository>) -> Self {
        Self {
            workspaces,
            audit: AuditRecorder::disabled(),
        }
    }

    pub fn with_audit(mut self, audit: AuditRecorder) -> Self {
        self.audit = audit;
        self
    }

    async fn resolve_write(
        &self,
        workspace_id: &WorkspaceId,
        actor: &Actor,
        operation: AuditOperation,
    ) -> Result<Workspace, ServiceError> {
        let workspace = self
            .workspaces
            .get_workspace(workspace_id)
            .await
            .map_err(|e| e.to_service_error())?;
        match WorkspacePolicy::resolve_for_write(workspace.as_ref(), actor) {
            Ok(ws) => Ok(ws.clone()),
            Err(err) => {
                self.audit.record(
                    AuditEvent::new(operation, AuditOutcome::Denied)
                        .with_actor(actor.user_id.as_str())
                        .with_workspace(workspace_id.as_str()),
                );
                Err(err)
            }
        }
    }

    fn record(&self, operation: AuditOperation, actor: &Actor, workspace_id: &WorkspaceId) {
        self.audit.record(
            AuditEvent::new(operation, AuditOutcome::Succeeded)
                .with_actor(actor.user_id.as_str())
                .with_workspace(workspace_id.as_str()),
        );
    }

    pub async fn create(
        &self,
        actor: &Actor,
        name: &str,
        visibility: Visibility,
    ) -> Result<Workspace, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::validation("workspace name is required"));
        }

        let workspace =
            Workspace::new(name.trim(), actor.user_id.clone()).with_visibility(visibility);
        self.workspaces
            .save_workspace(workspace.clone())
            .await
            .map_err(|e| e.to_service_error())?;

        self.record(AuditOperation::WorkspaceCreate, actor, &workspace.id);
        Ok(workspace)
    }

    pub async fn get(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
    ) -> Result<Workspace, ServiceError> {
        let workspace = self
            .workspaces
            .get_workspace(workspace_id)
            .await
            .map_err(|e| e.to_service_error())?;
        WorkspacePolicy::resolve_for_read(workspace.as_ref(), actor).cloned()
    }

    /// Lists the workspaces the actor can read; archived ones only for
    /// admins.
    pub async fn list(&self, actor: &Actor) -> Result<Vec<Workspace>, ServiceError> {
        let all = self
            .workspaces
            .list_workspaces(actor.is_admin())
            .await
            .map_err(|e| e.to_service_error())?;
        Ok(all
            .into_iter()
            .filter(|ws| WorkspacePolicy::can_read(ws, actor))
            .collect())
    }

    pub async fn publish(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
        visibility: Visibility,
    ) -> Result<(), ServiceError> {
        self.resolve_write(workspace_id, actor, AuditOperation::WorkspacePublish)
            .await?;
        self.workspaces
            .publish_workspace(workspace_id, visibility)
            .await
            .map_err(|e| e.to_service_error())?;
        self.record(AuditOperation::WorkspacePublish, actor, workspace_id);
        Ok(())
    }

    pub async fn share(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
        acl: WorkspaceAcl,
    ) -> Result<(), ServiceError> {
        self.resolve_write(workspace_id, actor, AuditOperation::WorkspaceShare)
            .await?;
        self.workspaces
            .share_workspace(workspace_id, acl)
            .await
            .map_err(|e| e.to_service_error())?;
        self.record(AuditOperation::WorkspaceShare, actor, workspace_id);
        Ok(())
    }

    /// Soft delete: the workspace disappears from listings and refuses
    /// ingest and query from then on.
    pub async fn archive(
        &self,
        actor: &Actor,
        workspace_id: &WorkspaceId,
    ) -> Result<(), ServiceError> {
        self.resolve_write(workspace_id, actor, AuditOperation::WorkspaceArchive)
            .await?;
        self.workspaces
            .archive_workspace(workspace_id)
            .await
            .map_err(|e| e.to_service_error())?;
        self.record(AuditOperation::WorkspaceArchive, actor, workspace_id);
        Ok(())
    }
}
