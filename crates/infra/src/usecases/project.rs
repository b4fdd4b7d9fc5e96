use tracing::{info, instrument};

use orgauth_auth::{
    Project, ProjectAuthorization, ProjectRole, Upserted, User, ensure_not_self, normalize_email,
};
use orgauth_events::Action;

use super::{
    AuthorizationService, CreateProjectAuthorizationDTO, DeleteProjectAuthorizationDTO,
    ProjectGrant, UpdateProjectAuthorizationDTO, UseCaseResult,
};

impl AuthorizationService {
    /// Grant `role` on a project to an existing user. A user without an
    /// organization authorization gets one as `Viewer` first.
    #[instrument(
        skip(self, dto),
        fields(project_id = %dto.project_uuid, user_email = %dto.user_email, created_by = ?dto.created_by_email),
        err
    )]
    pub fn create_project_authorization(
        &self,
        dto: CreateProjectAuthorizationDTO,
    ) -> UseCaseResult<Upserted<ProjectAuthorization>> {
        let role = dto.role.ensure_grantable()?;
        let project = self.projects.get_by_uuid(dto.project_uuid)?;
        let user = self.users.get_user_by_email(&dto.user_email)?;

        self.apply_project_role(&project, &user, role)
    }

    /// Change the role of a project authorization (upsert when absent). A
    /// pending project invite only has its role changed.
    #[instrument(skip(self, dto), fields(project_id = %dto.project_uuid, user_email = %dto.user_email), err)]
    pub fn update_project_authorization(
        &self,
        dto: UpdateProjectAuthorizationDTO,
    ) -> UseCaseResult<ProjectGrant> {
        let project = self.projects.get_by_uuid(dto.project_uuid)?;
        let email = normalize_email(&dto.user_email);
        ensure_not_self(dto.request_user.as_deref(), &email)?;
        let role = dto.role.ensure_grantable()?;

        if self.store.get_project_authorization(project.id, &email)?.is_none() {
            if let Some(invite) = self.store.get_project_invite(project.id, &email)? {
                let upserted =
                    self.store
                        .upsert_project_invite(&project, &email, role, invite.created_by)?;
                info!(role = %role, "pending project invite updated");
                return Ok(ProjectGrant::Pending(upserted));
            }
        }

        let user = self.users.get_user_by_email(&email)?;
        Ok(ProjectGrant::Active(self.apply_project_role(&project, &user, role)?))
    }

    /// Remove one project authorization. When it was the last one tied to its
    /// organization authorization and that role cannot contribute, the
    /// organization authorization goes too.
    #[instrument(skip(self, dto), fields(project_id = %dto.project_uuid, user_email = %dto.user_email), err)]
    pub fn delete_project_authorization(
        &self,
        dto: DeleteProjectAuthorizationDTO,
    ) -> UseCaseResult<Option<ProjectAuthorization>> {
        let project = self.projects.get_by_uuid(dto.project_uuid)?;
        let email = normalize_email(&dto.user_email);
        ensure_not_self(dto.request_user.as_deref(), &email)?;

        let had_invite = self.store.delete_project_invite(project.id, &email)?;
        let Some(removal) = self.store.delete_project_authorization(project.id, &email)? else {
            info!(had_invite, "project authorization already absent");
            return Ok(None);
        };
        self.emit_project(Action::Delete, &removal.removed)?;

        if removal.remaining == 0 {
            let parent = self
                .store
                .get_organization_authorization_by_id(removal.removed.organization_authorization_id)?;
            if let Some(parent) = parent.filter(|p| !p.can_contribute()) {
                info!(
                    organization_id = %parent.organization_id,
                    role = %parent.role,
                    "last project authorization removed; dropping organization authorization"
                );
                self.remove_organization_authorization(parent.organization_id, &email)?;
            }
        }

        Ok(Some(removal.removed))
    }

    /// Ensure the parent organization authorization, upsert the project
    /// authorization, clear any pending invite, and publish.
    pub(super) fn apply_project_role(
        &self,
        project: &Project,
        user: &User,
        role: ProjectRole,
    ) -> UseCaseResult<Upserted<ProjectAuthorization>> {
        let parent = self
            .store
            .ensure_organization_authorization(user, project.organization_id)?;
        if let Some(changed) = parent.changed() {
            self.emit_organization(Action::from_upsert(changed.created), &changed.record)?;
        }

        let upserted = self
            .store
            .upsert_project_authorization(project, user, role, parent.record())?;
        self.store.delete_project_invite(project.id, &user.email)?;
        self.emit_project(Action::from_upsert(upserted.created), &upserted.record)?;

        info!(
            project_id = %project.id,
            user_email = %user.email,
            role = %role,
            created = upserted.created,
            "project authorization upserted"
        );
        Ok(upserted)
    }
}
