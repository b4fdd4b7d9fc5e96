//! Pending invites: issuing them, turning them into authorizations once the
//! invited email registers, and listing what is still pending.

use tracing::{info, instrument, warn};

use orgauth_auth::{
    AuthorizationState, OrganizationAuthorization, ProjectAuthorization,
    RequestPermissionOrganization, RequestPermissionProject, Transition, Upserted,
    normalize_email,
};
use orgauth_core::{OrganizationId, ProjectId};
use orgauth_events::Action;

use super::{
    AuthorizationService, InviteToOrganizationDTO, InviteToProjectDTO, OrganizationGrant,
    ProjectGrant, UseCaseResult,
};

/// Authorizations created from pending invites for one email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Materialized {
    pub organizations: Vec<Upserted<OrganizationAuthorization>>,
    pub projects: Vec<Upserted<ProjectAuthorization>>,
}

impl Materialized {
    pub fn is_empty(&self) -> bool {
        self.organizations.is_empty() && self.projects.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInvites {
    pub organizations: Vec<RequestPermissionOrganization>,
    pub projects: Vec<RequestPermissionProject>,
}

impl AuthorizationService {
    /// Invite an email into an organization. Emails with an account are
    /// granted immediately; others get a pending invite.
    #[instrument(skip(self, dto), fields(organization_id = %dto.org_uuid, email = %dto.email), err)]
    pub fn invite_to_organization(&self, dto: InviteToOrganizationDTO) -> UseCaseResult<OrganizationGrant> {
        let organization = self.organizations.get_by_uuid(dto.org_uuid)?;
        let creator = self.users.get_user_by_email(&dto.created_by_email)?;
        let email = normalize_email(&dto.email);

        let existing = self.store.get_organization_authorization(organization.id, &email)?;
        let invite = self.store.get_organization_invite(organization.id, &email)?;
        let current = AuthorizationState::resolve(existing.as_ref(), invite.as_ref());

        let user = self.users.find_user_by_email(&email)?;
        let next = current.next(Transition::Invite {
            role: dto.role,
            has_account: user.is_some(),
        })?;

        match (next, user, existing) {
            (AuthorizationState::Active(role), Some(user), _) => {
                let upserted = self.apply_organization_role(organization.id, &user, role)?;
                self.store.delete_organization_invite(organization.id, &email)?;
                Ok(OrganizationGrant::Active(upserted))
            }
            (AuthorizationState::Active(_), None, Some(existing)) => {
                warn!(user_email = %email, "invited email has an authorization but no account");
                Ok(OrganizationGrant::Active(Upserted::updated(existing)))
            }
            (state, _, _) => {
                let role = match state {
                    AuthorizationState::PendingInvite(role) => role,
                    _ => dto.role,
                };
                let upserted =
                    self.store
                        .upsert_organization_invite(organization.id, &email, role, creator.id)?;
                info!(
                    role = %role,
                    created = upserted.created,
                    "organization invite pending"
                );
                Ok(OrganizationGrant::Pending(upserted))
            }
        }
    }

    /// Invite an email into a project. Emails with an account are granted
    /// immediately; others get a pending project invite.
    #[instrument(skip(self, dto), fields(project_id = %dto.project_uuid, email = %dto.email), err)]
    pub fn invite_to_project(&self, dto: InviteToProjectDTO) -> UseCaseResult<ProjectGrant> {
        let role = dto.role.ensure_grantable()?;
        let project = self.projects.get_by_uuid(dto.project_uuid)?;
        let creator = self.users.get_user_by_email(&dto.created_by_email)?;
        let email = normalize_email(&dto.email);

        if let Some(user) = self.users.find_user_by_email(&email)? {
            return Ok(ProjectGrant::Active(self.apply_project_role(&project, &user, role)?));
        }

        let upserted = self
            .store
            .upsert_project_invite(&project, &email, role, creator.id)?;
        info!(role = %role, created = upserted.created, "project invite pending");
        Ok(ProjectGrant::Pending(upserted))
    }

    /// Convert every pending invite for a newly registered email into
    /// authorizations. Organization invites go first so project invites find
    /// their parent already granted.
    #[instrument(skip(self), err)]
    pub fn materialize_pending_invites(&self, email: &str) -> UseCaseResult<Materialized> {
        let user = self.users.get_user_by_email(email)?;
        let mut materialized = Materialized::default();

        for invite in self.store.list_organization_invites_for_email(&user.email)? {
            let existing = self
                .store
                .get_organization_authorization(invite.organization_id, &user.email)?;
            let state = AuthorizationState::resolve(existing.as_ref(), Some(&invite))
                .next(Transition::UserRegistered)?;
            let AuthorizationState::Active(role) = state else {
                continue;
            };

            let upserted = self
                .store
                .materialize_organization_invite(&invite, &user, role)?;
            self.emit_organization(Action::from_upsert(upserted.created), &upserted.record)?;
            self.cascade_organization_role(&upserted.record)?;
            materialized.organizations.push(upserted);
        }

        for invite in self.store.list_project_invites_for_email(&user.email)? {
            let project = self.projects.get_by_uuid(invite.project_id)?;
            let outcome = self
                .store
                .materialize_project_invite(&invite, &user, &project)?;
            if let Some(changed) = outcome.organization.changed() {
                self.emit_organization(Action::from_upsert(changed.created), &changed.record)?;
            }
            self.emit_project(Action::from_upsert(outcome.project.created), &outcome.project.record)?;
            materialized.projects.push(outcome.project);
        }

        info!(
            user_email = %user.email,
            organizations = materialized.organizations.len(),
            projects = materialized.projects.len(),
            "pending invites materialized"
        );
        Ok(materialized)
    }

    /// Registration signal: record the account in the user directory, then
    /// materialize whatever was pending for its email.
    #[instrument(skip(self), err)]
    pub fn register_user(&self, email: &str, has_2fa: Option<bool>) -> UseCaseResult<Materialized> {
        let user = self.users.register_user(email, has_2fa)?;
        self.materialize_pending_invites(&user.email)
    }

    pub fn pending_invites_for_email(&self, email: &str) -> UseCaseResult<PendingInvites> {
        let email = normalize_email(email);
        Ok(PendingInvites {
            organizations: self.store.list_organization_invites_for_email(&email)?,
            projects: self.store.list_project_invites_for_email(&email)?,
        })
    }

    pub fn pending_organization_invites(
        &self,
        org_uuid: OrganizationId,
    ) -> UseCaseResult<Vec<RequestPermissionOrganization>> {
        let organization = self.organizations.get_by_uuid(org_uuid)?;
        Ok(self.store.list_organization_invites(organization.id)?)
    }

    pub fn pending_project_invites(
        &self,
        project_uuid: ProjectId,
    ) -> UseCaseResult<Vec<RequestPermissionProject>> {
        let project = self.projects.get_by_uuid(project_uuid)?;
        Ok(self.store.list_project_invites(project.id)?)
    }
}

#[cfg(test)]
mod tests {
    use orgauth_auth::{OrganizationRole, ProjectRole};

    use super::super::fixtures::World;
    use super::super::*;
    use super::*;

    fn invite_project(world: &World, project: ProjectId, email: &str, role: ProjectRole) -> ProjectGrant {
        world
            .service
            .invite_to_project(InviteToProjectDTO {
                project_uuid: project,
                email: email.to_string(),
                role,
                created_by_email: world.admin.email.clone(),
            })
            .unwrap()
    }

    #[test]
    fn project_invite_materializes_when_user_registers() {
        let world = World::new(1);
        let project = world.projects[0];

        let grant = invite_project(&world, project, "x@y.com", ProjectRole::Viewer);
        assert!(matches!(grant, ProjectGrant::Pending(_)));
        assert!(world.sink.events("project-auths.topic").is_empty());

        world.add_user("x@y.com");
        let materialized = world.service.materialize_pending_invites("x@y.com").unwrap();

        assert_eq!(materialized.projects.len(), 1);
        assert!(world.store.get_project_invite(project, "x@y.com").unwrap().is_none());
        let auth = world
            .store
            .get_project_authorization(project, "x@y.com")
            .unwrap()
            .unwrap();
        assert_eq!(auth.role.code(), 3);
        assert!(world
            .store
            .get_organization_authorization(world.organization, "x@y.com")
            .unwrap()
            .is_some());
    }

    #[test]
    fn registration_creates_the_account_and_materializes() {
        let world = World::new(1);
        let project = world.projects[0];
        invite_project(&world, project, "new@acme.io", ProjectRole::Contributor);

        let materialized = world.service.register_user("New@Acme.io", Some(true)).unwrap();

        assert_eq!(materialized.projects.len(), 1);
        assert!(world.store.get_project_invite(project, "new@acme.io").unwrap().is_none());
        let org_auth = world
            .store
            .get_organization_authorization(world.organization, "new@acme.io")
            .unwrap()
            .unwrap();
        assert!(org_auth.has_2fa);

        // A repeated signal finds nothing left to materialize.
        assert!(world.service.register_user("new@acme.io", None).unwrap().is_empty());
    }

    #[test]
    fn invite_for_existing_account_grants_immediately() {
        let world = World::new(2);
        world.add_user("dev@acme.io");

        let grant = world
            .service
            .invite_to_organization(InviteToOrganizationDTO {
                org_uuid: world.organization,
                email: "Dev@Acme.io".into(),
                role: OrganizationRole::Contributor,
                created_by_email: world.admin.email.clone(),
            })
            .unwrap();

        assert!(matches!(grant, OrganizationGrant::Active(ref u) if u.created));
        assert_eq!(
            world
                .store
                .list_project_authorizations_for_user(world.organization, "dev@acme.io")
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn reinvite_updates_pending_role_in_place() {
        let world = World::new(0);
        for role in [OrganizationRole::Viewer, OrganizationRole::Admin] {
            world
                .service
                .invite_to_organization(InviteToOrganizationDTO {
                    org_uuid: world.organization,
                    email: "new@acme.io".into(),
                    role,
                    created_by_email: world.admin.email.clone(),
                })
                .unwrap();
        }

        let pending = world.service.pending_organization_invites(world.organization).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].role, OrganizationRole::Admin);
        assert_eq!(pending[0].created_by, world.admin.id);
    }

    #[test]
    fn organization_invite_cascades_on_registration() {
        let world = World::new(2);
        world
            .service
            .invite_to_organization(InviteToOrganizationDTO {
                org_uuid: world.organization,
                email: "lead@acme.io".into(),
                role: OrganizationRole::Admin,
                created_by_email: world.admin.email.clone(),
            })
            .unwrap();

        world.add_user("lead@acme.io");
        let materialized = world.service.materialize_pending_invites("lead@acme.io").unwrap();

        assert_eq!(materialized.organizations.len(), 1);
        assert_eq!(materialized.organizations[0].record.role, OrganizationRole::Admin);
        let projects = world
            .store
            .list_project_authorizations_for_user(world.organization, "lead@acme.io")
            .unwrap();
        assert_eq!(projects.len(), 2);
        assert!(projects.iter().all(|p| p.role == ProjectRole::Moderator));
        assert!(world.service.pending_invites_for_email("lead@acme.io").unwrap().organizations.is_empty());
    }

    #[test]
    fn materializing_without_invites_is_empty() {
        let world = World::new(1);
        world.add_user("quiet@acme.io");
        assert!(world.service.materialize_pending_invites("quiet@acme.io").unwrap().is_empty());
    }

    #[test]
    fn unknown_creator_is_not_found() {
        let world = World::new(1);
        let err = world
            .service
            .invite_to_project(InviteToProjectDTO {
                project_uuid: world.projects[0],
                email: "x@y.com".into(),
                role: ProjectRole::Viewer,
                created_by_email: "ghost@acme.io".into(),
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
