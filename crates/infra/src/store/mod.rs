//! Authorization Store: consistency-preserving persistence of authorization
//! and pending-invite records.
//!
//! ## Uniqueness
//!
//! - one `OrganizationAuthorization` per (organization, user email)
//! - one `ProjectAuthorization` per (project, user email)
//! - one pending invite per (organization | project, email)
//!
//! Every write is a single atomic operation: creating a record that already
//! exists updates it in place (upsert). Deletes of absent records succeed.
//!
//! ## Cascades
//!
//! Deleting an organization authorization also removes any project
//! authorization still referencing it, so a project grant never outlives its
//! parent. The upward direction is left to the caller:
//! `delete_project_authorization` reports how many project authorizations
//! still reference the same organization authorization.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryAuthorizationStore;
pub use postgres::PostgresAuthorizationStore;

use thiserror::Error;

use orgauth_auth::{
    OrganizationAuthorization, OrganizationRole, Project, ProjectAuthorization, ProjectRole,
    RequestPermissionOrganization, RequestPermissionProject, Upserted, User,
};
use orgauth_core::{OrganizationAuthorizationId, OrganizationId, ProjectId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("store lock poisoned")]
    Poisoned,

    /// A project authorization was written against an organization
    /// authorization that no longer exists or holds NOT_SET.
    #[error("parent organization authorization {0} is missing or NOT_SET")]
    MissingParent(OrganizationAuthorizationId),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of `delete_project_authorization`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRemoval {
    pub removed: ProjectAuthorization,
    /// Project authorizations still tied to `removed.organization_authorization_id`.
    pub remaining: usize,
}

/// Result of `ensure_organization_authorization`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured<T> {
    /// A usable record already existed and was left untouched.
    Existing(T),
    /// The record was created or raised to the minimum role.
    Changed(Upserted<T>),
}

impl<T> Ensured<T> {
    pub fn record(&self) -> &T {
        match self {
            Ensured::Existing(record) => record,
            Ensured::Changed(upserted) => &upserted.record,
        }
    }

    pub fn changed(&self) -> Option<&Upserted<T>> {
        match self {
            Ensured::Existing(_) => None,
            Ensured::Changed(upserted) => Some(upserted),
        }
    }
}

/// Result of `materialize_project_invite`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMaterialization {
    pub organization: Ensured<OrganizationAuthorization>,
    pub project: Upserted<ProjectAuthorization>,
}

/// Authorization persistence. Emails passed in must already be normalized.
pub trait AuthorizationStore: Send + Sync {
    // -- organization authorizations ------------------------------------

    fn upsert_organization_authorization(
        &self,
        user: &User,
        organization_id: OrganizationId,
        role: OrganizationRole,
        has_2fa: bool,
    ) -> StoreResult<Upserted<OrganizationAuthorization>>;

    /// Make sure `user` holds an organization authorization with a role other
    /// than `NotSet`: creates one as `Viewer`, or raises `NotSet` to `Viewer`.
    fn ensure_organization_authorization(
        &self,
        user: &User,
        organization_id: OrganizationId,
    ) -> StoreResult<Ensured<OrganizationAuthorization>>;

    fn get_organization_authorization(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<OrganizationAuthorization>>;

    fn get_organization_authorization_by_id(
        &self,
        id: OrganizationAuthorizationId,
    ) -> StoreResult<Option<OrganizationAuthorization>>;

    fn list_organization_authorizations(
        &self,
        organization_id: OrganizationId,
    ) -> StoreResult<Vec<OrganizationAuthorization>>;

    fn list_organization_authorizations_for_user(
        &self,
        email: &str,
    ) -> StoreResult<Vec<OrganizationAuthorization>>;

    /// Remove the record. `Ok(None)` when it was already absent.
    fn delete_organization_authorization(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<OrganizationAuthorization>>;

    /// Copy `has_2fa` onto every organization authorization of `email`.
    /// Returns the records whose flag actually changed.
    fn set_has_2fa_for_user(
        &self,
        email: &str,
        has_2fa: bool,
    ) -> StoreResult<Vec<OrganizationAuthorization>>;

    // -- project authorizations -----------------------------------------

    fn upsert_project_authorization(
        &self,
        project: &Project,
        user: &User,
        role: ProjectRole,
        organization_authorization: &OrganizationAuthorization,
    ) -> StoreResult<Upserted<ProjectAuthorization>>;

    fn get_project_authorization(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<ProjectAuthorization>>;

    fn list_project_authorizations(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Vec<ProjectAuthorization>>;

    fn list_project_authorizations_for_user(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Vec<ProjectAuthorization>>;

    fn delete_project_authorization(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<ProjectRemoval>>;

    // -- pending invites ------------------------------------------------

    fn upsert_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
        role: OrganizationRole,
        created_by: UserId,
    ) -> StoreResult<Upserted<RequestPermissionOrganization>>;

    fn upsert_project_invite(
        &self,
        project: &Project,
        email: &str,
        role: ProjectRole,
        created_by: UserId,
    ) -> StoreResult<Upserted<RequestPermissionProject>>;

    fn get_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<RequestPermissionOrganization>>;

    fn get_project_invite(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<RequestPermissionProject>>;

    fn list_organization_invites(
        &self,
        organization_id: OrganizationId,
    ) -> StoreResult<Vec<RequestPermissionOrganization>>;

    fn list_project_invites(&self, project_id: ProjectId)
    -> StoreResult<Vec<RequestPermissionProject>>;

    fn list_organization_invites_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Vec<RequestPermissionOrganization>>;

    fn list_project_invites_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Vec<RequestPermissionProject>>;

    fn delete_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<bool>;

    fn delete_project_invite(&self, project_id: ProjectId, email: &str) -> StoreResult<bool>;

    /// Turn a pending organization invite into an authorization with `role`
    /// and delete the invite, in one atomic step.
    fn materialize_organization_invite(
        &self,
        invite: &RequestPermissionOrganization,
        user: &User,
        role: OrganizationRole,
    ) -> StoreResult<Upserted<OrganizationAuthorization>>;

    /// Turn a pending project invite into a project authorization (ensuring
    /// the parent organization authorization) and delete the invite, in one
    /// atomic step.
    fn materialize_project_invite(
        &self,
        invite: &RequestPermissionProject,
        user: &User,
        project: &Project,
    ) -> StoreResult<ProjectMaterialization>;
}
