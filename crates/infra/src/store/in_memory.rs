use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use orgauth_auth::{
    OrganizationAuthorization, OrganizationRole, Project, ProjectAuthorization, ProjectRole,
    RequestPermissionOrganization, RequestPermissionProject, Upserted, User,
};
use orgauth_core::{
    OrganizationAuthorizationId, OrganizationId, ProjectAuthorizationId, ProjectId,
    RequestPermissionId, UserId,
};

use super::{
    AuthorizationStore, Ensured, ProjectMaterialization, ProjectRemoval, StoreError, StoreResult,
};

type OrgKey = (OrganizationId, String);
type ProjectKey = (ProjectId, String);

#[derive(Debug, Default)]
struct StoreState {
    organization_authorizations: BTreeMap<OrgKey, OrganizationAuthorization>,
    project_authorizations: BTreeMap<ProjectKey, ProjectAuthorization>,
    organization_invites: BTreeMap<OrgKey, RequestPermissionOrganization>,
    project_invites: BTreeMap<ProjectKey, RequestPermissionProject>,
}

impl StoreState {
    fn upsert_organization(
        &mut self,
        user: &User,
        organization_id: OrganizationId,
        role: OrganizationRole,
        has_2fa: bool,
    ) -> Upserted<OrganizationAuthorization> {
        let now = Utc::now();
        let key = (organization_id, user.email.clone());

        if let Some(existing) = self.organization_authorizations.get_mut(&key) {
            existing.user_id = user.id;
            existing.role = role;
            existing.has_2fa = has_2fa;
            existing.updated_at = now;
            return Upserted::updated(existing.clone());
        }

        let record = OrganizationAuthorization {
            id: OrganizationAuthorizationId::new(),
            organization_id,
            user_id: user.id,
            user_email: user.email.clone(),
            role,
            has_2fa,
            created_at: now,
            updated_at: now,
        };
        self.organization_authorizations.insert(key, record.clone());
        Upserted::created(record)
    }

    fn ensure_organization(
        &mut self,
        user: &User,
        organization_id: OrganizationId,
    ) -> Ensured<OrganizationAuthorization> {
        let key = (organization_id, user.email.clone());
        match self.organization_authorizations.get(&key) {
            Some(existing) if existing.role != OrganizationRole::NotSet => {
                Ensured::Existing(existing.clone())
            }
            Some(existing) => {
                let has_2fa = existing.has_2fa;
                Ensured::Changed(self.upsert_organization(
                    user,
                    organization_id,
                    OrganizationRole::Viewer,
                    has_2fa,
                ))
            }
            None => Ensured::Changed(self.upsert_organization(
                user,
                organization_id,
                OrganizationRole::Viewer,
                user.has_2fa,
            )),
        }
    }

    fn upsert_project(
        &mut self,
        project: &Project,
        user: &User,
        role: ProjectRole,
        organization_authorization: &OrganizationAuthorization,
    ) -> StoreResult<Upserted<ProjectAuthorization>> {
        let parent_live = self
            .organization_authorizations
            .get(&(project.organization_id, user.email.clone()))
            .is_some_and(|parent| {
                parent.id == organization_authorization.id && parent.role != OrganizationRole::NotSet
            });
        if !parent_live {
            return Err(StoreError::MissingParent(organization_authorization.id));
        }

        let now = Utc::now();
        let key = (project.id, user.email.clone());

        if let Some(existing) = self.project_authorizations.get_mut(&key) {
            existing.user_id = user.id;
            existing.role = role;
            existing.organization_authorization_id = organization_authorization.id;
            existing.updated_at = now;
            return Ok(Upserted::updated(existing.clone()));
        }

        let record = ProjectAuthorization {
            id: ProjectAuthorizationId::new(),
            project_id: project.id,
            organization_id: project.organization_id,
            user_id: user.id,
            user_email: user.email.clone(),
            role,
            organization_authorization_id: organization_authorization.id,
            created_at: now,
            updated_at: now,
        };
        self.project_authorizations.insert(key, record.clone());
        Ok(Upserted::created(record))
    }
}

/// In-memory Authorization Store.
///
/// Intended for tests/dev. Each operation runs inside one write (or read)
/// critical section, which gives it the same atomicity as a transaction.
#[derive(Debug, Default)]
pub struct InMemoryAuthorizationStore {
    state: RwLock<StoreState>,
}

impl InMemoryAuthorizationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, StoreState>> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, StoreState>> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }
}

impl AuthorizationStore for InMemoryAuthorizationStore {
    fn upsert_organization_authorization(
        &self,
        user: &User,
        organization_id: OrganizationId,
        role: OrganizationRole,
        has_2fa: bool,
    ) -> StoreResult<Upserted<OrganizationAuthorization>> {
        Ok(self.write()?.upsert_organization(user, organization_id, role, has_2fa))
    }

    fn ensure_organization_authorization(
        &self,
        user: &User,
        organization_id: OrganizationId,
    ) -> StoreResult<Ensured<OrganizationAuthorization>> {
        Ok(self.write()?.ensure_organization(user, organization_id))
    }

    fn get_organization_authorization(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<OrganizationAuthorization>> {
        Ok(self
            .read()?
            .organization_authorizations
            .get(&(organization_id, email.to_string()))
            .cloned())
    }

    fn get_organization_authorization_by_id(
        &self,
        id: OrganizationAuthorizationId,
    ) -> StoreResult<Option<OrganizationAuthorization>> {
        Ok(self
            .read()?
            .organization_authorizations
            .values()
            .find(|a| a.id == id)
            .cloned())
    }

    fn list_organization_authorizations(
        &self,
        organization_id: OrganizationId,
    ) -> StoreResult<Vec<OrganizationAuthorization>> {
        Ok(self
            .read()?
            .organization_authorizations
            .values()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect())
    }

    fn list_organization_authorizations_for_user(
        &self,
        email: &str,
    ) -> StoreResult<Vec<OrganizationAuthorization>> {
        Ok(self
            .read()?
            .organization_authorizations
            .values()
            .filter(|a| a.user_email == email)
            .cloned()
            .collect())
    }

    fn delete_organization_authorization(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<OrganizationAuthorization>> {
        let mut state = self.write()?;
        let removed = state
            .organization_authorizations
            .remove(&(organization_id, email.to_string()));

        if let Some(auth) = &removed {
            state
                .project_authorizations
                .retain(|_, p| p.organization_authorization_id != auth.id);
        }
        Ok(removed)
    }

    fn set_has_2fa_for_user(
        &self,
        email: &str,
        has_2fa: bool,
    ) -> StoreResult<Vec<OrganizationAuthorization>> {
        let now = Utc::now();
        let mut state = self.write()?;
        Ok(state
            .organization_authorizations
            .values_mut()
            .filter(|a| a.user_email == email && a.has_2fa != has_2fa)
            .map(|a| {
                a.has_2fa = has_2fa;
                a.updated_at = now;
                a.clone()
            })
            .collect())
    }

    fn upsert_project_authorization(
        &self,
        project: &Project,
        user: &User,
        role: ProjectRole,
        organization_authorization: &OrganizationAuthorization,
    ) -> StoreResult<Upserted<ProjectAuthorization>> {
        self.write()?
            .upsert_project(project, user, role, organization_authorization)
    }

    fn get_project_authorization(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<ProjectAuthorization>> {
        Ok(self
            .read()?
            .project_authorizations
            .get(&(project_id, email.to_string()))
            .cloned())
    }

    fn list_project_authorizations(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Vec<ProjectAuthorization>> {
        Ok(self
            .read()?
            .project_authorizations
            .values()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect())
    }

    fn list_project_authorizations_for_user(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Vec<ProjectAuthorization>> {
        Ok(self
            .read()?
            .project_authorizations
            .values()
            .filter(|a| a.organization_id == organization_id && a.user_email == email)
            .cloned()
            .collect())
    }

    fn delete_project_authorization(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<ProjectRemoval>> {
        let mut state = self.write()?;
        let Some(removed) = state
            .project_authorizations
            .remove(&(project_id, email.to_string()))
        else {
            return Ok(None);
        };

        let remaining = state
            .project_authorizations
            .values()
            .filter(|a| a.organization_authorization_id == removed.organization_authorization_id)
            .count();

        Ok(Some(ProjectRemoval { removed, remaining }))
    }

    fn upsert_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
        role: OrganizationRole,
        created_by: UserId,
    ) -> StoreResult<Upserted<RequestPermissionOrganization>> {
        let mut state = self.write()?;
        let key = (organization_id, email.to_string());

        if let Some(existing) = state.organization_invites.get_mut(&key) {
            existing.role = role;
            return Ok(Upserted::updated(existing.clone()));
        }

        let invite = RequestPermissionOrganization {
            id: RequestPermissionId::new(),
            organization_id,
            email: email.to_string(),
            role,
            created_by,
            created_at: Utc::now(),
        };
        state.organization_invites.insert(key, invite.clone());
        Ok(Upserted::created(invite))
    }

    fn upsert_project_invite(
        &self,
        project: &Project,
        email: &str,
        role: ProjectRole,
        created_by: UserId,
    ) -> StoreResult<Upserted<RequestPermissionProject>> {
        let mut state = self.write()?;
        let key = (project.id, email.to_string());

        if let Some(existing) = state.project_invites.get_mut(&key) {
            existing.role = role;
            return Ok(Upserted::updated(existing.clone()));
        }

        let invite = RequestPermissionProject {
            id: RequestPermissionId::new(),
            project_id: project.id,
            organization_id: project.organization_id,
            email: email.to_string(),
            role,
            created_by,
            created_at: Utc::now(),
        };
        state.project_invites.insert(key, invite.clone());
        Ok(Upserted::created(invite))
    }

    fn get_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<Option<RequestPermissionOrganization>> {
        Ok(self
            .read()?
            .organization_invites
            .get(&(organization_id, email.to_string()))
            .cloned())
    }

    fn get_project_invite(
        &self,
        project_id: ProjectId,
        email: &str,
    ) -> StoreResult<Option<RequestPermissionProject>> {
        Ok(self
            .read()?
            .project_invites
            .get(&(project_id, email.to_string()))
            .cloned())
    }

    fn list_organization_invites(
        &self,
        organization_id: OrganizationId,
    ) -> StoreResult<Vec<RequestPermissionOrganization>> {
        Ok(self
            .read()?
            .organization_invites
            .values()
            .filter(|r| r.organization_id == organization_id)
            .cloned()
            .collect())
    }

    fn list_project_invites(
        &self,
        project_id: ProjectId,
    ) -> StoreResult<Vec<RequestPermissionProject>> {
        Ok(self
            .read()?
            .project_invites
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    fn list_organization_invites_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Vec<RequestPermissionOrganization>> {
        Ok(self
            .read()?
            .organization_invites
            .values()
            .filter(|r| r.email == email)
            .cloned()
            .collect())
    }

    fn list_project_invites_for_email(
        &self,
        email: &str,
    ) -> StoreResult<Vec<RequestPermissionProject>> {
        Ok(self
            .read()?
            .project_invites
            .values()
            .filter(|r| r.email == email)
            .cloned()
            .collect())
    }

    fn delete_organization_invite(
        &self,
        organization_id: OrganizationId,
        email: &str,
    ) -> StoreResult<bool> {
        Ok(self
            .write()?
            .organization_invites
            .remove(&(organization_id, email.to_string()))
            .is_some())
    }

    fn delete_project_invite(&self, project_id: ProjectId, email: &str) -> StoreResult<bool> {
        Ok(self
            .write()?
            .project_invites
            .remove(&(project_id, email.to_string()))
            .is_some())
    }

    fn materialize_organization_invite(
        &self,
        invite: &RequestPermissionOrganization,
        user: &User,
        role: OrganizationRole,
    ) -> StoreResult<Upserted<OrganizationAuthorization>> {
        let mut state = self.write()?;
        let upserted = state.upsert_organization(user, invite.organization_id, role, user.has_2fa);
        state
            .organization_invites
            .remove(&(invite.organization_id, invite.email.clone()));
        Ok(upserted)
    }

    fn materialize_project_invite(
        &self,
        invite: &RequestPermissionProject,
        user: &User,
        project: &Project,
    ) -> StoreResult<ProjectMaterialization> {
        let mut state = self.write()?;
        let organization = state.ensure_organization(user, project.organization_id);
        let project_auth = state.upsert_project(project, user, invite.role, organization.record())?;
        state
            .project_invites
            .remove(&(invite.project_id, invite.email.clone()));

        Ok(ProjectMaterialization {
            organization,
            project: project_auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str) -> User {
        User::new(UserId::new(), email)
    }

    #[test]
    fn upsert_organization_authorization_is_idempotent() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let u = user("a@b.com");

        let first = store
            .upsert_organization_authorization(&u, org, OrganizationRole::Admin, false)
            .unwrap();
        let second = store
            .upsert_organization_authorization(&u, org, OrganizationRole::Admin, false)
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(store.list_organization_authorizations(org).unwrap().len(), 1);
    }

    #[test]
    fn upsert_updates_role_in_place() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let u = user("a@b.com");

        store
            .upsert_organization_authorization(&u, org, OrganizationRole::Viewer, false)
            .unwrap();
        let updated = store
            .upsert_organization_authorization(&u, org, OrganizationRole::Support, true)
            .unwrap();

        assert_eq!(updated.record.role, OrganizationRole::Support);
        assert!(updated.record.has_2fa);
    }

    #[test]
    fn delete_project_authorization_reports_remaining() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let u = user("a@b.com");
        let auth = store
            .upsert_organization_authorization(&u, org, OrganizationRole::Admin, false)
            .unwrap()
            .record;
        let p1 = Project::new(ProjectId::new(), org, "p1");
        let p2 = Project::new(ProjectId::new(), org, "p2");
        store
            .upsert_project_authorization(&p1, &u, ProjectRole::Moderator, &auth)
            .unwrap();
        store
            .upsert_project_authorization(&p2, &u, ProjectRole::Moderator, &auth)
            .unwrap();

        let first = store.delete_project_authorization(p1.id, &u.email).unwrap().unwrap();
        assert_eq!(first.remaining, 1);
        let second = store.delete_project_authorization(p2.id, &u.email).unwrap().unwrap();
        assert_eq!(second.remaining, 0);
        assert!(store.delete_project_authorization(p2.id, &u.email).unwrap().is_none());
    }

    #[test]
    fn deleting_absent_organization_authorization_is_not_an_error() {
        let store = InMemoryAuthorizationStore::new();
        let removed = store
            .delete_organization_authorization(OrganizationId::new(), "ghost@b.com")
            .unwrap();
        assert!(removed.is_none());
    }

    #[test]
    fn deleting_organization_authorization_drops_dependent_project_grants() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let u = user("a@b.com");
        let auth = store
            .upsert_organization_authorization(&u, org, OrganizationRole::Contributor, false)
            .unwrap()
            .record;
        let project = Project::new(ProjectId::new(), org, "p");
        store
            .upsert_project_authorization(&project, &u, ProjectRole::Contributor, &auth)
            .unwrap();

        store.delete_organization_authorization(org, &u.email).unwrap();

        assert!(store.list_project_authorizations(project.id).unwrap().is_empty());
    }

    #[test]
    fn project_grant_requires_a_live_parent() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let u = user("a@b.com");
        let project = Project::new(ProjectId::new(), org, "p");
        let parent = store
            .upsert_organization_authorization(&u, org, OrganizationRole::Contributor, false)
            .unwrap()
            .record;
        store.delete_organization_authorization(org, &u.email).unwrap();

        let err = store
            .upsert_project_authorization(&project, &u, ProjectRole::Contributor, &parent)
            .unwrap_err();
        assert_eq!(err, StoreError::MissingParent(parent.id));
        assert!(store.list_project_authorizations(project.id).unwrap().is_empty());

        let not_set = store
            .upsert_organization_authorization(&u, org, OrganizationRole::NotSet, false)
            .unwrap()
            .record;
        assert!(matches!(
            store.upsert_project_authorization(&project, &u, ProjectRole::Viewer, &not_set),
            Err(StoreError::MissingParent(_))
        ));
        assert!(store.list_project_authorizations(project.id).unwrap().is_empty());
    }

    #[test]
    fn ensure_creates_viewer_and_raises_not_set() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let u = user("a@b.com");

        let created = store.ensure_organization_authorization(&u, org).unwrap();
        assert_eq!(created.record().role, OrganizationRole::Viewer);
        assert!(created.changed().unwrap().created);

        let existing = store.ensure_organization_authorization(&u, org).unwrap();
        assert!(existing.changed().is_none());

        store
            .upsert_organization_authorization(&u, org, OrganizationRole::NotSet, false)
            .unwrap();
        let raised = store.ensure_organization_authorization(&u, org).unwrap();
        assert_eq!(raised.record().role, OrganizationRole::Viewer);
        assert!(!raised.changed().unwrap().created);
    }

    #[test]
    fn materializing_a_project_invite_removes_it_atomically() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let project = Project::new(ProjectId::new(), org, "p");
        let creator = UserId::new();

        let invite = store
            .upsert_project_invite(&project, "x@y.com", ProjectRole::Viewer, creator)
            .unwrap()
            .record;
        let u = user("x@y.com");

        let done = store.materialize_project_invite(&invite, &u, &project).unwrap();

        assert!(done.project.created);
        assert_eq!(done.project.record.role, ProjectRole::Viewer);
        assert_eq!(done.organization.record().role, OrganizationRole::Viewer);
        assert!(store.get_project_invite(project.id, "x@y.com").unwrap().is_none());
    }

    #[test]
    fn reinviting_updates_pending_role() {
        let store = InMemoryAuthorizationStore::new();
        let org = OrganizationId::new();
        let creator = UserId::new();

        store
            .upsert_organization_invite(org, "x@y.com", OrganizationRole::Viewer, creator)
            .unwrap();
        let again = store
            .upsert_organization_invite(org, "x@y.com", OrganizationRole::Admin, creator)
            .unwrap();

        assert!(!again.created);
        assert_eq!(store.list_organization_invites(org).unwrap().len(), 1);
        assert_eq!(again.record.role, OrganizationRole::Admin);
    }

    #[test]
    fn set_has_2fa_returns_only_changed_records() {
        let store = InMemoryAuthorizationStore::new();
        let u = user("a@b.com");
        let (o1, o2) = (OrganizationId::new(), OrganizationId::new());
        store
            .upsert_organization_authorization(&u, o1, OrganizationRole::Viewer, true)
            .unwrap();
        store
            .upsert_organization_authorization(&u, o2, OrganizationRole::Viewer, false)
            .unwrap();

        let changed = store.set_has_2fa_for_user(&u.email, true).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].organization_id, o2);
    }
}
