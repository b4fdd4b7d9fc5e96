use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use orgauth_auth::{Organization, Project, User, normalize_email};
use orgauth_core::{DomainError, OrganizationId, ProjectId, UserId};

use super::{OrganizationRepository, ProjectRepository, UserDirectory};

#[derive(Debug, Default)]
struct DirectoryState {
    users: BTreeMap<String, User>,
    organizations: BTreeMap<OrganizationId, Organization>,
    projects: BTreeMap<ProjectId, Project>,
}

/// In-memory users, organizations and projects (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

/// Directory contents loaded in one go (a JSON file for local runs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySeed {
    pub users: Vec<User>,
    pub organizations: Vec<Organization>,
    pub projects: Vec<Project>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let directory = Self::new();
        for mut user in seed.users {
            user.email = normalize_email(&user.email);
            directory.add_user(user);
        }
        for organization in seed.organizations {
            directory.add_organization(organization);
        }
        for project in seed.projects {
            directory.add_project(project);
        }
        directory
    }

    pub fn add_user(&self, user: User) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.users.insert(user.email.clone(), user);
    }

    pub fn add_organization(&self, organization: Organization) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.organizations.insert(organization.id, organization);
    }

    pub fn add_project(&self, project: Project) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.projects.insert(project.id, project);
    }

    pub fn set_has_2fa(&self, email: &str, has_2fa: bool) -> Result<(), DomainError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let user = state
            .users
            .get_mut(&normalize_email(email))
            .ok_or_else(|| DomainError::user_does_not_exist(email))?;
        user.has_2fa = has_2fa;
        Ok(())
    }
}

impl UserDirectory for InMemoryDirectory {
    fn get_user_by_email(&self, email: &str) -> Result<User, DomainError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .users
            .get(&normalize_email(email))
            .cloned()
            .ok_or_else(|| DomainError::user_does_not_exist(email))
    }

    fn get_user_by_id(&self, id: UserId) -> Result<User, DomainError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .users
            .values()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| DomainError::user_does_not_exist(id.to_string()))
    }

    fn register_user(&self, email: &str, has_2fa: Option<bool>) -> Result<User, DomainError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(DomainError::validation("user email must not be empty"));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let user = state
            .users
            .entry(email.clone())
            .or_insert_with(|| User::new(UserId::new(), &email));
        if let Some(flag) = has_2fa {
            user.has_2fa = flag;
        }
        Ok(user.clone())
    }
}

impl OrganizationRepository for InMemoryDirectory {
    fn get_by_uuid(&self, id: OrganizationId) -> Result<Organization, DomainError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .organizations
            .get(&id)
            .cloned()
            .ok_or(DomainError::OrganizationDoesNotExist(id))
    }
}

impl ProjectRepository for InMemoryDirectory {
    fn get_by_uuid(&self, id: ProjectId) -> Result<Project, DomainError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .projects
            .get(&id)
            .cloned()
            .ok_or(DomainError::ProjectDoesNotExist(id))
    }

    fn list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Project>, DomainError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if !state.organizations.contains_key(&organization_id) {
            return Err(DomainError::OrganizationDoesNotExist(organization_id));
        }
        Ok(state
            .projects
            .values()
            .filter(|p| p.organization_id == organization_id)
            .cloned()
            .collect())
    }
}
