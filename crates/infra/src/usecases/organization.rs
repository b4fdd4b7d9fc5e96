use tracing::{info, instrument};

use orgauth_auth::{
    AuthorizationState, OrganizationAuthorization, OrganizationRole, Transition, Upserted, User,
    ensure_not_self, normalize_email, organization_role_to_project_role,
};
use orgauth_core::{DomainError, OrganizationAuthorizationId, OrganizationId, ProjectId};
use orgauth_events::{Action, ProjectMembersNotice};

use super::{
    AuthorizationService, CreateAuthorizationDTO, DeleteAuthorizationDTO, OrganizationGrant,
    UpdateAuthorizationDTO, UseCaseResult, holder_of,
};

impl AuthorizationService {
    /// Grant `role` on an organization to an existing user, cascading into
    /// every project when the role can contribute.
    #[instrument(skip(self, dto), fields(organization_id = %dto.org_uuid, user_email = %dto.user_email), err)]
    pub fn create_authorization(
        &self,
        dto: CreateAuthorizationDTO,
    ) -> UseCaseResult<Upserted<OrganizationAuthorization>> {
        let role = dto.role.ensure_grantable()?;
        let organization = self.organizations.get_by_uuid(dto.org_uuid)?;
        let user = self.users.get_user_by_email(&dto.user_email)?;

        let upserted = self.apply_organization_role(organization.id, &user, role)?;
        self.store.delete_organization_invite(organization.id, &user.email)?;
        Ok(upserted)
    }

    /// Change the role of an organization authorization.
    ///
    /// A pending invite only has its role changed. An absent pair is created
    /// (upsert), which requires the user to exist.
    #[instrument(skip(self, dto), fields(organization_id = %dto.org_uuid), err)]
    pub fn update_authorization(&self, dto: UpdateAuthorizationDTO) -> UseCaseResult<OrganizationGrant> {
        let organization = self.organizations.get_by_uuid(dto.org_uuid)?;
        let email = self
            .resolve_target(organization.id, dto.id, dto.user_email.as_deref())?
            .ok_or_else(|| DomainError::validation("organization authorization not found"))?;
        ensure_not_self(dto.request_user.as_deref(), &email)?;
        let role = dto.role.ensure_grantable()?;

        let existing = self.store.get_organization_authorization(organization.id, &email)?;
        let invite = self.store.get_organization_invite(organization.id, &email)?;
        let current = AuthorizationState::resolve(existing.as_ref(), invite.as_ref());

        match (current.next(Transition::Update(role))?, invite) {
            (AuthorizationState::PendingInvite(role), Some(invite)) => {
                let upserted = self.store.upsert_organization_invite(
                    organization.id,
                    &email,
                    role,
                    invite.created_by,
                )?;
                info!(user_email = %email, role = %role, "pending organization invite updated");
                Ok(OrganizationGrant::Pending(upserted))
            }
            (AuthorizationState::Absent, _) => {
                Err(DomainError::validation("update cannot remove an authorization").into())
            }
            _ => {
                let user = self.users.get_user_by_email(&email)?;
                Ok(OrganizationGrant::Active(self.apply_organization_role(
                    organization.id,
                    &user,
                    role,
                )?))
            }
        }
    }

    /// Remove an organization authorization and every project authorization
    /// of the same user under that organization. Absent targets succeed.
    #[instrument(skip(self, dto), fields(organization_id = %dto.org_uuid), err)]
    pub fn delete_authorization(
        &self,
        dto: DeleteAuthorizationDTO,
    ) -> UseCaseResult<Option<OrganizationAuthorization>> {
        let organization = self.organizations.get_by_uuid(dto.org_uuid)?;
        let Some(email) = self.resolve_target(organization.id, dto.id, dto.user_email.as_deref())?
        else {
            info!("organization authorization already absent");
            return Ok(None);
        };
        ensure_not_self(dto.request_user.as_deref(), &email)?;

        self.remove_organization_authorization(organization.id, &email)
    }

    /// Re-copy the user's `has_2fa` flag onto all of their organization
    /// authorizations. Returns how many records changed.
    #[instrument(skip(self), err)]
    pub fn sync_two_factor(&self, email: &str) -> UseCaseResult<usize> {
        let user = self.users.get_user_by_email(email)?;
        let changed = self.store.set_has_2fa_for_user(&user.email, user.has_2fa)?;

        for auth in &changed {
            self.emit_organization(Action::Update, auth)?;
        }
        info!(user_email = %user.email, has_2fa = user.has_2fa, changed = changed.len(), "2fa flag synchronised");
        Ok(changed.len())
    }

    /// User-updated signal: store a reported `has_2fa` flag in the directory,
    /// then resync it onto the user's organization authorizations.
    #[instrument(skip(self), err)]
    pub fn record_user_update(&self, email: &str, has_2fa: Option<bool>) -> UseCaseResult<usize> {
        if has_2fa.is_some() {
            self.users.register_user(email, has_2fa)?;
        }
        self.sync_two_factor(email)
    }

    /// Cascade every contributing organization member into a newly added
    /// project, then send one project-membership notice.
    #[instrument(skip(self), fields(project_id = %project_uuid), err)]
    pub fn grant_organization_members_to_project(&self, project_uuid: ProjectId) -> UseCaseResult<usize> {
        let project = self.projects.get_by_uuid(project_uuid)?;
        let mut granted = Vec::new();

        for auth in self
            .store
            .list_organization_authorizations(project.organization_id)?
        {
            let Some(role) = organization_role_to_project_role(auth.role) else {
                continue;
            };
            let upserted =
                self.store
                    .upsert_project_authorization(&project, &holder_of(&auth), role, &auth)?;
            self.emit_project(Action::from_upsert(upserted.created), &upserted.record)?;
            granted.push(auth.user_email);
        }

        let count = granted.len();
        let notice = ProjectMembersNotice::new(project.organization_id, project.id, granted);
        self.emit_value(&self.destinations.update_projects, &notice)?;

        info!(granted = count, "organization members granted to project");
        Ok(count)
    }

    /// Upsert the organization authorization, publish it, then cascade.
    pub(super) fn apply_organization_role(
        &self,
        organization_id: OrganizationId,
        user: &User,
        role: OrganizationRole,
    ) -> UseCaseResult<Upserted<OrganizationAuthorization>> {
        let upserted =
            self.store
                .upsert_organization_authorization(user, organization_id, role, user.has_2fa)?;
        self.emit_organization(Action::from_upsert(upserted.created), &upserted.record)?;
        info!(
            organization_id = %organization_id,
            user_email = %user.email,
            role = %role,
            created = upserted.created,
            "organization authorization upserted"
        );

        self.cascade_organization_role(&upserted.record)?;
        Ok(upserted)
    }

    /// Upsert the mapped project role into every project of the organization.
    /// Roles that cannot contribute leave existing project grants untouched.
    pub(super) fn cascade_organization_role(
        &self,
        auth: &OrganizationAuthorization,
    ) -> UseCaseResult<usize> {
        let Some(project_role) = organization_role_to_project_role(auth.role) else {
            return Ok(0);
        };

        let holder = holder_of(auth);
        let projects = self.projects.list_by_organization(auth.organization_id)?;
        for project in &projects {
            let upserted =
                self.store
                    .upsert_project_authorization(project, &holder, project_role, auth)?;
            self.emit_project(Action::from_upsert(upserted.created), &upserted.record)?;
        }

        info!(
            organization_id = %auth.organization_id,
            user_email = %auth.user_email,
            project_role = %project_role,
            projects = projects.len(),
            "organization role cascaded"
        );
        Ok(projects.len())
    }

    /// Delete the user's project authorizations under the organization, any
    /// pending invite, and finally the organization authorization itself.
    pub(super) fn remove_organization_authorization(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> UseCaseResult<Option<OrganizationAuthorization>> {
        for project_auth in self
            .store
            .list_project_authorizations_for_user(organization_id, email)?
        {
            if let Some(removal) = self
                .store
                .delete_project_authorization(project_auth.project_id, email)?
            {
                self.emit_project(Action::Delete, &removal.removed)?;
            }
        }

        let had_invite = self.store.delete_organization_invite(organization_id, email)?;

        match self
            .store
            .delete_organization_authorization(organization_id, email)?
        {
            Some(removed) => {
                self.emit_organization(Action::Delete, &removed)?;
                info!(organization_id = %organization_id, user_email = %email, "organization authorization deleted");
                Ok(Some(removed))
            }
            None => {
                info!(
                    organization_id = %organization_id,
                    user_email = %email,
                    had_invite,
                    "organization authorization already absent"
                );
                Ok(None)
            }
        }
    }

    /// Email of the targeted pair: by id when given, otherwise by email.
    /// `None` when an id was given and no such record exists.
    fn resolve_target(
        &self,
        organization_id: OrganizationId,
        id: Option<OrganizationAuthorizationId>,
        email: Option<&str>,
    ) -> UseCaseResult<Option<String>> {
        if let Some(id) = id {
            match self.store.get_organization_authorization_by_id(id)? {
                Some(auth) if auth.organization_id == organization_id => {
                    return Ok(Some(auth.user_email));
                }
                Some(_) => {
                    return Err(DomainError::validation(format!(
                        "authorization {id} belongs to another organization"
                    ))
                    .into());
                }
                None if email.is_none() => return Ok(None),
                None => {}
            }
        }

        email
            .map(|e| Some(normalize_email(e)))
            .ok_or_else(|| DomainError::validation("either id or user_email is required").into())
    }
}

#[cfg(test)]
mod tests {
    use orgauth_auth::{OrganizationRole, ProjectRole};
    use orgauth_events::Action;

    use super::super::fixtures::World;
    use super::super::*;

    fn create(world: &World, email: &str, role: OrganizationRole) -> Upserted<OrganizationAuthorization> {
        world
            .service
            .create_authorization(CreateAuthorizationDTO {
                user_email: email.to_string(),
                org_uuid: world.organization,
                role,
            })
            .unwrap()
    }

    #[test]
    fn downgrade_to_viewer_leaves_project_grants_alone() {
        let world = World::new(2);
        world.add_user("dev@acme.io");
        create(&world, "dev@acme.io", OrganizationRole::Admin);
        let project_events_before = world.sink.events("project-auths.topic").len();

        let grant = world
            .service
            .update_authorization(UpdateAuthorizationDTO {
                org_uuid: world.organization,
                role: OrganizationRole::Viewer,
                request_user: Some(world.admin.email.clone()),
                id: None,
                user_email: Some("dev@acme.io".into()),
            })
            .unwrap();
        assert!(matches!(grant, OrganizationGrant::Active(ref u) if u.record.role == OrganizationRole::Viewer));

        for project in &world.projects {
            let auth = world
                .store
                .get_project_authorization(*project, "dev@acme.io")
                .unwrap()
                .unwrap();
            assert_eq!(auth.role, ProjectRole::Moderator);
        }
        assert_eq!(world.sink.events("project-auths.topic").len(), project_events_before);
        let last = world.sink.events("orgs-auths.topic").pop().unwrap();
        assert_eq!((last.action, last.role), (Action::Update, Some(OrganizationRole::Viewer.code())));
    }

    #[test]
    fn admin_grant_cascades_moderator_into_every_project() {
        let world = World::new(3);
        world.add_user("dev@acme.io");

        let upserted = create(&world, "dev@acme.io", OrganizationRole::Admin);
        assert!(upserted.created);

        for project in &world.projects {
            let auth = world
                .store
                .get_project_authorization(*project, "dev@acme.io")
                .unwrap()
                .unwrap();
            assert_eq!(auth.role, ProjectRole::Moderator);
            assert_eq!(auth.organization_authorization_id, upserted.record.id);
        }

        let org_events = world.sink.events("orgs-auths.topic");
        assert_eq!(org_events.len(), 1);
        assert_eq!(org_events[0].action, Action::Create);
        assert_eq!(org_events[0].role, Some(3));
        assert_eq!(world.sink.events("project-auths.topic").len(), 3);
    }

    #[test]
    fn viewer_grant_does_not_cascade() {
        let world = World::new(2);
        world.add_user("v@acme.io");

        create(&world, "v@acme.io", OrganizationRole::Viewer);

        for project in &world.projects {
            assert!(world.store.list_project_authorizations(*project).unwrap().is_empty());
        }
        assert!(world.sink.events("project-auths.topic").is_empty());
    }

    #[test]
    fn create_for_unknown_user_propagates_not_found() {
        let world = World::new(1);
        let err = world
            .service
            .create_authorization(CreateAuthorizationDTO {
                user_email: "ghost@acme.io".into(),
                org_uuid: world.organization,
                role: OrganizationRole::Admin,
            })
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(world.sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn not_set_role_is_rejected_before_any_mutation() {
        let world = World::new(1);
        world.add_user("dev@acme.io");
        let err = world
            .service
            .create_authorization(CreateAuthorizationDTO {
                user_email: "dev@acme.io".into(),
                org_uuid: world.organization,
                role: OrganizationRole::NotSet,
            })
            .unwrap_err();
        assert!(err.is_permission());
        assert!(world.store.list_organization_authorizations(world.organization).unwrap().is_empty());
    }

    #[test]
    fn self_update_is_denied_and_role_unchanged() {
        let world = World::new(1);
        create(&world, "admin@acme.io", OrganizationRole::Admin);

        let err = world
            .service
            .update_authorization(UpdateAuthorizationDTO {
                org_uuid: world.organization,
                role: OrganizationRole::Viewer,
                request_user: Some("Admin@Acme.io".into()),
                id: None,
                user_email: Some("admin@acme.io".into()),
            })
            .unwrap_err();

        assert!(err.is_permission());
        let auth = world
            .store
            .get_organization_authorization(world.organization, "admin@acme.io")
            .unwrap()
            .unwrap();
        assert_eq!(auth.role, OrganizationRole::Admin);
    }

    #[test]
    fn update_by_id_to_contributor_cascades_and_emits_update() {
        let world = World::new(2);
        world.add_user("dev@acme.io");
        let created = create(&world, "dev@acme.io", OrganizationRole::Viewer);

        let grant = world
            .service
            .update_authorization(UpdateAuthorizationDTO {
                org_uuid: world.organization,
                role: OrganizationRole::Contributor,
                request_user: Some(world.admin.email.clone()),
                id: Some(created.record.id),
                user_email: None,
            })
            .unwrap();

        let OrganizationGrant::Active(updated) = grant else {
            panic!("expected an active grant");
        };
        assert!(!updated.created);
        assert_eq!(updated.record.role, OrganizationRole::Contributor);
        for project in &world.projects {
            let auth = world
                .store
                .get_project_authorization(*project, "dev@acme.io")
                .unwrap()
                .unwrap();
            assert_eq!(auth.role, ProjectRole::Contributor);
        }
        let org_events = world.sink.events("orgs-auths.topic");
        assert_eq!(org_events.len(), 2);
        assert_eq!(org_events[1].action, Action::Update);
    }

    #[test]
    fn delete_cascades_to_projects_then_organization() {
        let world = World::new(2);
        world.add_user("dev@acme.io");
        create(&world, "dev@acme.io", OrganizationRole::Support);

        let removed = world
            .service
            .delete_authorization(DeleteAuthorizationDTO {
                org_uuid: world.organization,
                request_user: Some(world.admin.email.clone()),
                id: None,
                user_email: Some("dev@acme.io".into()),
            })
            .unwrap();

        assert!(removed.is_some());
        assert!(world
            .store
            .get_organization_authorization(world.organization, "dev@acme.io")
            .unwrap()
            .is_none());
        for project in &world.projects {
            assert!(world.store.list_project_authorizations(*project).unwrap().is_empty());
        }

        let project_deletes = world
            .sink
            .events("project-auths.topic")
            .into_iter()
            .filter(|e| e.action == Action::Delete)
            .count();
        assert_eq!(project_deletes, 2);
        assert_eq!(world.sink.events("orgs-auths.topic").last().unwrap().action, Action::Delete);
    }

    #[test]
    fn deleting_an_absent_authorization_is_a_no_op() {
        let world = World::new(1);
        let removed = world
            .service
            .delete_authorization(DeleteAuthorizationDTO {
                org_uuid: world.organization,
                request_user: None,
                id: None,
                user_email: Some("nobody@acme.io".into()),
            })
            .unwrap();
        assert!(removed.is_none());
        assert!(world.sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn sync_two_factor_updates_flags() {
        let world = World::new(0);
        world.add_user("dev@acme.io");
        create(&world, "dev@acme.io", OrganizationRole::Viewer);
        world.directory.set_has_2fa("dev@acme.io", true).unwrap();

        assert_eq!(world.service.sync_two_factor("dev@acme.io").unwrap(), 1);
        assert_eq!(world.service.sync_two_factor("dev@acme.io").unwrap(), 0);

        let last = world.sink.events("orgs-auths.topic").pop().unwrap();
        assert_eq!(last.has_2fa, Some(true));
    }

    #[test]
    fn new_project_receives_contributing_members() {
        let world = World::new(0);
        world.add_user("a@acme.io");
        world.add_user("b@acme.io");
        create(&world, "a@acme.io", OrganizationRole::Admin);
        create(&world, "b@acme.io", OrganizationRole::Financial);

        let project = orgauth_auth::Project::new(
            orgauth_core::ProjectId::new(),
            world.organization,
            "late",
        );
        world.directory.add_project(project.clone());

        let granted = world
            .service
            .grant_organization_members_to_project(project.id)
            .unwrap();

        assert_eq!(granted, 1);
        let notices = world.sink.bodies("update-projects.topic");
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0]["user_emails"], serde_json::json!(["a@acme.io"]));
    }

    #[test]
    fn publishing_can_be_switched_off() {
        let world = World::new(1);
        world.add_user("dev@acme.io");
        let quiet = world.service.clone().publish_message(false);

        quiet
            .create_authorization(CreateAuthorizationDTO {
                user_email: "dev@acme.io".into(),
                org_uuid: world.organization,
                role: OrganizationRole::Admin,
            })
            .unwrap();

        assert!(!quiet.publishes());
        assert!(world.sink.sent.lock().unwrap().is_empty());
    }
}
