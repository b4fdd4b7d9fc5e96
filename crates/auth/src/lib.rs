//! `orgauth-auth`: the authorization model (pure, no IO).
//!
//! Roles and their mapping, the Organization/Project/User entities the engine
//! reasons about, authorization and pending-invite records, and the per-pair
//! state machine that the use cases drive.

pub mod authorization;
pub mod guard;
pub mod organization;
pub mod roles;
pub mod state;
pub mod user;

pub use authorization::{
    OrganizationAuthorization, ProjectAuthorization, RequestPermissionOrganization,
    RequestPermissionProject, Upserted,
};
pub use guard::{ensure_not_self, normalize_email};
pub use organization::{Organization, Project};
pub use roles::{OrganizationRole, ProjectRole, organization_role_to_project_role};
pub use state::{AuthorizationState, Transition};
pub use user::User;
