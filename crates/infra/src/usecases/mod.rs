//! Authorization use cases.
//!
//! Each operation follows the same sequence:
//!
//! 1. validate at the boundary (role grantable, no self-modification)
//! 2. resolve referenced entities through the collaborators
//! 3. mutate the store (one atomic store call per step)
//! 4. publish exactly one event per committed mutation, when publishing is on
//!
//! Cascades run as sequential loops of steps 3–4. A failure mid-cascade leaves
//! the earlier steps committed and published; replaying the same call
//! converges because every store write is an upsert or an idempotent delete.

pub mod dto;
pub mod error;
mod invites;
mod organization;
mod project;

pub use dto::{
    CreateAuthorizationDTO, CreateProjectAuthorizationDTO, DeleteAuthorizationDTO,
    DeleteProjectAuthorizationDTO, InviteToOrganizationDTO, InviteToProjectDTO,
    UpdateAuthorizationDTO, UpdateProjectAuthorizationDTO,
};
pub use error::{UseCaseError, UseCaseResult};
pub use invites::{Materialized, PendingInvites};

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use orgauth_auth::{
    OrganizationAuthorization, ProjectAuthorization, RequestPermissionOrganization,
    RequestPermissionProject, Upserted, User,
};
use orgauth_events::{Action, AuthorizationEvent, EventSink, PublishError};

use crate::directory::{OrganizationRepository, ProjectRepository, UserDirectory};
use crate::store::AuthorizationStore;

/// Where outbound events go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub organization_authorizations: String,
    pub project_authorizations: String,
    pub update_projects: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            organization_authorizations: "orgs-auths.topic".to_string(),
            project_authorizations: "project-auths.topic".to_string(),
            update_projects: "update-projects.topic".to_string(),
        }
    }
}

/// Outcome of an organization-level grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganizationGrant {
    Active(Upserted<OrganizationAuthorization>),
    Pending(Upserted<RequestPermissionOrganization>),
}

/// Outcome of a project-level grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectGrant {
    Active(Upserted<ProjectAuthorization>),
    Pending(Upserted<RequestPermissionProject>),
}

#[derive(Clone)]
pub struct AuthorizationService {
    store: Arc<dyn AuthorizationStore>,
    users: Arc<dyn UserDirectory>,
    organizations: Arc<dyn OrganizationRepository>,
    projects: Arc<dyn ProjectRepository>,
    sink: Option<Arc<dyn EventSink>>,
    destinations: Destinations,
    publish_message: bool,
}

impl AuthorizationService {
    /// A service that does not publish until [`with_publisher`](Self::with_publisher) is called.
    pub fn new(
        store: Arc<dyn AuthorizationStore>,
        users: Arc<dyn UserDirectory>,
        organizations: Arc<dyn OrganizationRepository>,
        projects: Arc<dyn ProjectRepository>,
    ) -> Self {
        Self {
            store,
            users,
            organizations,
            projects,
            sink: None,
            destinations: Destinations::default(),
            publish_message: false,
        }
    }

    /// Attach an event sink and turn publishing on.
    pub fn with_publisher(mut self, sink: Arc<dyn EventSink>, destinations: Destinations) -> Self {
        self.sink = Some(sink);
        self.destinations = destinations;
        self.publish_message = true;
        self
    }

    pub fn publish_message(mut self, enabled: bool) -> Self {
        self.publish_message = enabled;
        self
    }

    pub fn publishes(&self) -> bool {
        self.publish_message && self.sink.is_some()
    }

    pub fn store(&self) -> &Arc<dyn AuthorizationStore> {
        &self.store
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    fn emit(&self, destination: &str, event: &AuthorizationEvent) -> UseCaseResult<()> {
        let Some(sink) = self.sink.as_ref().filter(|_| self.publish_message) else {
            return Ok(());
        };
        let receipt = sink.publish_event(event, destination)?;
        debug!(
            destination,
            action = %event.action,
            user_email = %event.user_email,
            attempts = receipt.attempts,
            "authorization event published"
        );
        Ok(())
    }

    fn emit_value<T: Serialize>(&self, destination: &str, body: &T) -> UseCaseResult<()> {
        let Some(sink) = self.sink.as_ref().filter(|_| self.publish_message) else {
            return Ok(());
        };
        let value = serde_json::to_value(body).map_err(PublishError::from)?;
        sink.publish_value(&value, destination)?;
        Ok(())
    }

    fn emit_organization(&self, action: Action, auth: &OrganizationAuthorization) -> UseCaseResult<()> {
        let event = AuthorizationEvent::organization(
            action,
            auth.organization_id,
            auth.user_email.clone(),
            auth.role.code(),
        )
        .with_has_2fa(auth.has_2fa);
        self.emit(&self.destinations.organization_authorizations, &event)
    }

    fn emit_project(&self, action: Action, auth: &ProjectAuthorization) -> UseCaseResult<()> {
        let event = AuthorizationEvent::project(
            action,
            auth.organization_id,
            auth.project_id,
            auth.user_email.clone(),
            auth.role.code(),
        );
        self.emit(&self.destinations.project_authorizations, &event)
    }
}

impl core::fmt::Debug for AuthorizationService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthorizationService")
            .field("destinations", &self.destinations)
            .field("publish_message", &self.publish_message)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

/// The account an authorization belongs to, as recorded on it.
fn holder_of(auth: &OrganizationAuthorization) -> User {
    User {
        id: auth.user_id,
        email: auth.user_email.clone(),
        has_2fa: auth.has_2fa,
    }
}
