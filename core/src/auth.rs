use crate::error::ServiceError;
use crate::model::{UserId, Visibility, Workspace};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
    Viewer,
}

/// The caller identity every use case receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn admin(user_id: impl Into<UserId>) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    pub exp: usize,
    #[serde(default)]
    pub nbf: Option<usize>,
    #[serde(default)]
    pub iat: Option<usize>,
}

impl TryFrom<JwtClaims> for Actor {
    type Error = AuthError;

    fn try_from(claims: JwtClaims) -> Result<Self, Self::Error> {
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }

        let role = match claims.role.as_deref().map(str::trim) {
            Some("admin") => Role::Admin,
            Some("member") | None => Role::Member,
            Some("viewer") => Role::Viewer,
            Some(other) => return Err(AuthError::UnknownRole(other.to_string())),
        };

        Ok(Actor {
            user_id: UserId(claims.sub),
            role,
        })
    }
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new_hs256(
        secret: impl AsRef<[u8]>,
        issuer: Option<&str>,
        audience: Option<&str>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = 0;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<Actor, AuthError> {
        let normalized = token
            .trim()
            .strip_prefix("Bearer ")
            .or_else(|| token.trim().strip_prefix("bearer "))
            .unwrap_or(token)
            .trim();
        if normalized.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let token_data = decode::<JwtClaims>(normalized, &self.decoding_key, &self.validation)
            .map_err(|err| AuthError::InvalidToken(err.to_string()))?;
        Actor::try_from(token_data.claims)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid jwt: {0}")]
    InvalidToken(String),
    #[error("jwt claim sub must not be empty")]
    MissingSubject,
    #[error("unknown role claim: {0}")]
    UnknownRole(String),
}

/// Workspace access rules consulted by every use case that touches
/// workspace-owned data.
///
/// Read denials collapse to NOT_FOUND so that a rejected caller cannot learn
/// whether the workspace exists.
pub struct WorkspacePolicy;

impl WorkspacePolicy {
    pub fn resolve_for_read<'a>(
        workspace: Option<&'a Workspace>,
        actor: &Actor,
    ) -> Result<&'a Workspace, ServiceError> {
        let Some(workspace) = workspace else {
            return Err(ServiceError::not_found("workspace not found"));
        };

        if actor.is_admin() {
            return Ok(workspace);
        }

        if !workspace.is_archived() && Self::readable_by(workspace, actor) {
            return Ok(workspace);
        }

        Err(ServiceError::not_found("workspace not found"))
    }

    pub fn resolve_for_write<'a>(
        workspace: Option<&'a Workspace>,
        actor: &Actor,
    ) -> Result<&'a Workspace, ServiceError> {
        let Some(workspace) = workspace else {
            return Err(ServiceError::not_found("workspace not found"));
        };

        let is_owner = workspace.owner_user_id == actor.user_id;
        if actor.is_admin() || is_owner {
            if workspace.is_archived() {
                return Err(ServiceError::conflict("workspace is archived"));
            }
            return Ok(workspace);
        }

        // A caller who could at least read the workspace learns FORBIDDEN;
        // anyone else gets the leak-safe NOT_FOUND.
        if !workspace.is_archived() && Self::readable_by(workspace, actor) {
            Err(ServiceError::forbidden("write access requires ownership"))
        } else {
            Err(ServiceError::not_found("workspace not found"))
        }
    }

    /// Whether `actor` may read `workspace`. Listing endpoints use this to
    /// filter rather than leak NOT_FOUND rows.
    pub fn can_read(workspace: &Workspace, actor: &Actor) -> bool {
        actor.is_admin() || (!workspace.is_archived() && Self::readable_by(workspace, actor))
    }

    fn readable_by(workspace: &Workspace, actor: &Actor) -> bool {
        if workspace.owner_user_id == actor.user_id {
            return true;
        }
        if workspace.visibility == Visibility::OrgRead {
            return true;
        }
        workspace
            .acl
            .as_ref()
            .is_some_and(|acl| acl.allows(&actor.user_id, actor.role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::model::WorkspaceAcl;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now() -> usize {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as usize
    }

    fn build_claims(exp_offset_secs: i64) -> JwtClaims {
        let n = now() as i64;
        JwtClaims {
            sub: "user-1".to_string(),
            role: Some("member".to_string()),
            iss: Some("atalaya-auth".to_string()),
            aud: Some("atalaya-api".to_string()),
            exp: (n + exp_offset_secs).max(0) as usize,
            nbf: Some((n - 1).max(0) as usize),
            iat: Some(n.max(0) as usize),
        }
    }

    fn encode_claims(secret: &str, claims: &JwtClaims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn workspace_owned_by(owner: &str) -> Workspace {
        Workspace::new("hr", UserId::from(owner))
    }

    #[test]
    fn authenticates_valid_token() {
        let secret = "test-secret";
        let token = encode_claims(secret, &build_claims(300));
        let auth = JwtAuthenticator::new_hs256(secret, Some("atalaya-auth"), Some("atalaya-api"));

        let actor = auth.authenticate(&token).unwrap();
        assert_eq!(actor.user_id.as_str(), "user-1");
        assert_eq!(actor.role, Role::Member);
    }

    #[test]
    fn rejects_expired_token() {
        let secret = "test-secret";
        let token = encode_claims(secret, &build_claims(-10));
        let auth = JwtAuthenticator::new_hs256(secret, Some("atalaya-auth"), Some("atalaya-api"));

        assert!(matches!(
            auth.authenticate(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn rejects_invalid_signature() {
        let token = encode_claims("wrong-secret", &build_claims(300));
        let auth =
            JwtAuthenticator::new_hs256("expected-secret", Some("atalaya-auth"), Some("atalaya-api"));

        assert!(matches!(
            auth.authenticate(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn read_allows_owner() {
        let ws = workspace_owned_by("u1");
        let actor = Actor::new("u1", Role::Member);
        assert!(WorkspacePolicy::resolve_for_read(Some(&ws), &actor).is_ok());
    }

    #[test]
    fn read_allows_org_read_for_any_authenticated_user() {
        let ws = workspace_owned_by("u1").with_visibility(Visibility::OrgRead);
        let actor = Actor::new("u2", Role::Viewer);
        assert!(WorkspacePolicy::resolve_for_read(Some(&ws), &actor).is_ok());
    }

    #[test]
    fn read_allows_acl_listed_user() {
        let ws = workspace_owned_by("u1").with_acl(WorkspaceAcl {
            allowed_user_ids: vec![UserId::from("u2")],
            allowed_roles: vec![],
        });
        let actor = Actor::new("u2", Role::Member);
        assert!(WorkspacePolicy::resolve_for_read(Some(&ws), &actor).is_ok());
    }

    #[test]
    fn read_denies_private_workspace_as_not_found() {
        let ws = workspace_owned_by("u1");
        let actor = Actor::new("u2", Role::Member);
        let err = WorkspacePolicy::resolve_for_read(Some(&ws), &actor).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn read_denies_archived_workspace_for_owner() {
        let mut ws = workspace_owned_by("u1");
        ws.archive();
        let actor = Actor::new("u1", Role::Member);
        let err = WorkspacePolicy::resolve_for_read(Some(&ws), &actor).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn read_allows_admin_even_when_archived() {
        let mut ws = workspace_owned_by("u1");
        ws.archive();
        let actor = Actor::admin("root");
        assert!(WorkspacePolicy::resolve_for_read(Some(&ws), &actor).is_ok());
    }

    #[test]
    fn write_allows_owner_and_admin_only() {
        let ws = workspace_owned_by("u1").with_visibility(Visibility::OrgRead);

        assert!(WorkspacePolicy::resolve_for_write(Some(&ws), &Actor::new("u1", Role::Member)).is_ok());
        assert!(WorkspacePolicy::resolve_for_write(Some(&ws), &Actor::admin("root")).is_ok());

        let err =
            WorkspacePolicy::resolve_for_write(Some(&ws), &Actor::new("u2", Role::Member)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[test]
    fn write_denies_hidden_workspace_as_not_found() {
        let ws = workspace_owned_by("u1");
        let err =
            WorkspacePolicy::resolve_for_write(Some(&ws), &Actor::new("u2", Role::Member)).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn write_refuses_archived_workspace_with_conflict() {
        let mut ws = workspace_owned_by("u1");
        ws.archive();
        let err =
            WorkspacePolicy::resolve_for_write(Some(&ws), &Actor::new("u1", Role::Member)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Conflict);
    }
}
