//! Integration tests for the full propagation pipeline.
//!
//! Tests: Use Case → Authorization Store → Event Publisher → broker, and
//! broker → Event Consumer → Use Case.
//!
//! Verifies:
//! - Store upserts are idempotent and cascades are complete
//! - Every committed mutation reaches its destination despite dropped channels
//! - Inbound deliveries are acked once applied, dead-lettered otherwise

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use orgauth_auth::{Organization, OrganizationRole, Project, ProjectRole, User};
    use orgauth_core::{OrganizationId, ProjectId, UserId};
    use orgauth_events::{
        Action, AuthorizationEvent, ConnectionHandle, EventPublisher, InMemoryBroker,
        InMemoryConnector, JsonBodyParser,
    };

    use crate::directory::{InMemoryDirectory, UserDirectory};
    use crate::messaging::{DeliveryOutcome, EventConsumer};
    use crate::store::{AuthorizationStore, InMemoryAuthorizationStore};
    use crate::usecases::{
        AuthorizationService, CreateAuthorizationDTO, CreateProjectAuthorizationDTO,
        DeleteProjectAuthorizationDTO, Destinations, InviteToProjectDTO, ProjectGrant,
        UpdateAuthorizationDTO,
    };

    const INBOUND: &str = "orgauth.authorizations";

    struct Pipeline {
        broker: Arc<InMemoryBroker>,
        connection: Arc<ConnectionHandle<InMemoryConnector>>,
        store: Arc<InMemoryAuthorizationStore>,
        directory: Arc<InMemoryDirectory>,
        service: AuthorizationService,
        consumer: EventConsumer<InMemoryConnector>,
        organization: OrganizationId,
        projects: Vec<ProjectId>,
    }

    impl Pipeline {
        fn new(project_count: usize) -> Self {
            let broker = Arc::new(InMemoryBroker::new());
            broker.bind(INBOUND, "authorizations-sync.topic");
            let connection = Arc::new(ConnectionHandle::new(InMemoryConnector::new(broker.clone())));
            let publisher = EventPublisher::new(connection.clone()).with_retry_delay(Duration::from_millis(1));

            let store = Arc::new(InMemoryAuthorizationStore::new());
            let directory = Arc::new(InMemoryDirectory::new());
            let organization = OrganizationId::new();
            directory.add_organization(Organization::new(organization, "acme"));
            let projects = (0..project_count)
                .map(|i| {
                    let id = ProjectId::new();
                    directory.add_project(Project::new(id, organization, format!("p{i}")));
                    id
                })
                .collect();
            directory.add_user(User::new(UserId::new(), "admin@acme.io"));

            let service = AuthorizationService::new(
                store.clone(),
                directory.clone(),
                directory.clone(),
                directory.clone(),
            )
            .with_publisher(Arc::new(publisher), Destinations::default());

            let consumer = EventConsumer::new(
                connection.clone(),
                INBOUND,
                Arc::new(JsonBodyParser),
                service.clone().publish_message(false),
            )
            .with_poll_timeout(Duration::from_millis(10));

            Self {
                broker,
                connection,
                store,
                directory,
                service,
                consumer,
                organization,
                projects,
            }
        }

        fn add_user(&self, email: &str) {
            self.directory.add_user(User::new(UserId::new(), email));
        }

        fn send(&self, event: &AuthorizationEvent) {
            self.broker.push(INBOUND, serde_json::to_vec(event).unwrap());
        }

        fn published(&self, destination: &str) -> Vec<AuthorizationEvent> {
            self.broker
                .published(destination)
                .iter()
                .map(|body| serde_json::from_slice(body).unwrap())
                .collect()
        }
    }

    #[test]
    fn store_upsert_is_idempotent() {
        let store = InMemoryAuthorizationStore::new();
        let user = User::new(UserId::new(), "dev@acme.io");
        let org = OrganizationId::new();

        let first = store
            .upsert_organization_authorization(&user, org, OrganizationRole::Contributor, false)
            .unwrap();
        let second = store
            .upsert_organization_authorization(&user, org, OrganizationRole::Contributor, false)
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(store.list_organization_authorizations(org).unwrap().len(), 1);
    }

    #[test]
    fn admin_grant_cascades_to_every_project_and_publishes() {
        let p = Pipeline::new(3);
        p.add_user("lead@acme.io");

        p.service
            .create_authorization(CreateAuthorizationDTO {
                user_email: "lead@acme.io".into(),
                org_uuid: p.organization,
                role: OrganizationRole::Admin,
            })
            .unwrap();

        let projects = p
            .store
            .list_project_authorizations_for_user(p.organization, "lead@acme.io")
            .unwrap();
        assert_eq!(projects.len(), 3);
        assert!(projects.iter().all(|a| a.role == ProjectRole::Moderator));

        let org_events = p.published("orgs-auths.topic");
        assert_eq!(org_events.len(), 1);
        assert_eq!(org_events[0].action, Action::Create);
        assert_eq!(org_events[0].role, Some(3));
        let project_events = p.published("project-auths.topic");
        assert_eq!(project_events.len(), 3);
        assert!(project_events.iter().all(|e| e.role == Some(1)));
    }

    #[test]
    fn deleting_the_last_project_grant_removes_the_organization_grant() {
        let p = Pipeline::new(1);
        p.add_user("dev@acme.io");
        p.service
            .create_project_authorization(CreateProjectAuthorizationDTO {
                user_email: "dev@acme.io".into(),
                project_uuid: p.projects[0],
                created_by_email: Some("admin@acme.io".into()),
                role: ProjectRole::Contributor,
            })
            .unwrap();
        assert_eq!(p.store.list_organization_authorizations(p.organization).unwrap().len(), 1);

        p.service
            .delete_project_authorization(DeleteProjectAuthorizationDTO {
                project_uuid: p.projects[0],
                user_email: "dev@acme.io".into(),
                request_user: Some("admin@acme.io".into()),
            })
            .unwrap();

        assert_eq!(p.store.list_organization_authorizations(p.organization).unwrap().len(), 0);
        let org_events = p.published("orgs-auths.topic");
        assert_eq!(org_events.last().map(|e| e.action), Some(Action::Delete));
    }

    #[test]
    fn self_update_is_denied_without_side_effects() {
        let p = Pipeline::new(2);
        p.add_user("dev@acme.io");
        p.service
            .create_authorization(CreateAuthorizationDTO {
                user_email: "dev@acme.io".into(),
                org_uuid: p.organization,
                role: OrganizationRole::Contributor,
            })
            .unwrap();
        let published_before = p.broker.published("orgs-auths.topic").len();

        let err = p
            .service
            .update_authorization(UpdateAuthorizationDTO {
                org_uuid: p.organization,
                role: OrganizationRole::Admin,
                request_user: Some("dev@acme.io".into()),
                id: None,
                user_email: Some("dev@acme.io".into()),
            })
            .unwrap_err();

        assert!(err.is_permission());
        let auth = p
            .store
            .get_organization_authorization(p.organization, "dev@acme.io")
            .unwrap()
            .unwrap();
        assert_eq!(auth.role, OrganizationRole::Contributor);
        assert_eq!(p.broker.published("orgs-auths.topic").len(), published_before);
    }

    #[test]
    fn registration_message_materializes_pending_project_invite() {
        let p = Pipeline::new(1);
        let grant = p
            .service
            .invite_to_project(InviteToProjectDTO {
                project_uuid: p.projects[0],
                email: "x@y.com".into(),
                role: ProjectRole::try_from(3).unwrap(),
                created_by_email: "admin@acme.io".into(),
            })
            .unwrap();
        assert!(matches!(grant, ProjectGrant::Pending(_)));

        // The account exists only through the registration message itself.
        p.send(&AuthorizationEvent::user_registered("x@y.com").with_has_2fa(true));
        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));

        assert!(p.directory.get_user_by_email("x@y.com").unwrap().has_2fa);

        assert!(p.store.get_project_invite(p.projects[0], "x@y.com").unwrap().is_none());
        let auth = p
            .store
            .get_project_authorization(p.projects[0], "x@y.com")
            .unwrap()
            .unwrap();
        assert_eq!(auth.role.code(), 3);
    }

    #[test]
    fn replayed_create_is_applied_once_and_acked_twice() {
        let p = Pipeline::new(2);
        p.add_user("dev@acme.io");
        let event = AuthorizationEvent::organization(
            Action::Create,
            p.organization,
            "dev@acme.io",
            OrganizationRole::Contributor.code(),
        );
        p.send(&event);
        p.send(&event);

        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));
        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));

        assert_eq!(p.store.list_organization_authorizations(p.organization).unwrap().len(), 1);
        assert_eq!(p.consumer.stats().snapshot().acknowledged, 2);
        assert_eq!(p.broker.unacked_count(), 0);
        // Inbound changes are not re-published.
        assert!(p.broker.published("orgs-auths.topic").is_empty());
    }

    #[test]
    fn delivery_interrupted_by_publish_failure_is_redelivered() {
        let p = Pipeline::new(1);
        p.add_user("dev@acme.io");
        let consumer = EventConsumer::new(
            p.connection.clone(),
            INBOUND,
            Arc::new(JsonBodyParser),
            p.service.clone(),
        )
        .with_poll_timeout(Duration::from_millis(10));
        p.send(&AuthorizationEvent::organization(
            Action::Create,
            p.organization,
            "dev@acme.io",
            OrganizationRole::Contributor.code(),
        ));
        p.broker.fail_next_publishes(1);

        // The publish reconnects, but the delivery's own channel is gone.
        assert!(consumer.poll_once().unwrap_err().is_transport());
        assert_eq!(p.broker.queue_len(INBOUND), 1);
        assert_eq!(p.broker.unacked_count(), 0);
        assert_eq!(consumer.stats().snapshot().acknowledged, 0);

        assert_eq!(consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));
        assert_eq!(p.broker.queue_len(INBOUND), 0);
        assert_eq!(p.broker.unacked_count(), 0);
        assert!(p.broker.dead_letters(INBOUND).is_empty());
        assert_eq!(consumer.stats().snapshot().acknowledged, 1);
        assert_eq!(p.connection.connect_count(), 2);

        assert_eq!(p.store.list_organization_authorizations(p.organization).unwrap().len(), 1);
        assert_eq!(
            p.store
                .list_project_authorizations_for_user(p.organization, "dev@acme.io")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn replayed_delete_on_absent_record_is_acked() {
        let p = Pipeline::new(1);
        let event = AuthorizationEvent::organization(Action::Delete, p.organization, "gone@acme.io", 0);
        p.send(&event);
        p.send(&event);

        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));
        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));
        assert!(p.broker.dead_letters(INBOUND).is_empty());
    }

    #[test]
    fn malformed_message_is_dead_lettered_and_consumption_continues() {
        let p = Pipeline::new(0);
        p.add_user("dev@acme.io");
        p.broker.push(INBOUND, "{not json");
        p.send(&AuthorizationEvent::organization(
            Action::Create,
            p.organization,
            "dev@acme.io",
            OrganizationRole::Viewer.code(),
        ));

        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::RejectedMalformed));
        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));

        let dead = p.broker.dead_letters(INBOUND);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"{not json".to_vec());
        assert_eq!(p.broker.queue_len(INBOUND), 0);
    }

    #[test]
    fn publish_survives_channel_failures() {
        let p = Pipeline::new(0);
        p.add_user("dev@acme.io");
        p.broker.fail_next_publishes(2);

        p.service
            .create_authorization(CreateAuthorizationDTO {
                user_email: "dev@acme.io".into(),
                org_uuid: p.organization,
                role: OrganizationRole::Viewer,
            })
            .unwrap();

        assert_eq!(p.published("orgs-auths.topic").len(), 1);
        assert!(p.connection.connect_count() >= 3);
    }

    #[test]
    fn consumer_reconnects_after_connection_drop() {
        let p = Pipeline::new(0);
        p.add_user("dev@acme.io");
        assert_eq!(p.consumer.poll_once().unwrap(), None);

        p.broker.drop_connections();
        p.send(&AuthorizationEvent::organization(
            Action::Create,
            p.organization,
            "dev@acme.io",
            OrganizationRole::Viewer.code(),
        ));

        assert_eq!(p.consumer.poll_once().unwrap(), Some(DeliveryOutcome::Acknowledged));
        assert_eq!(p.connection.connect_count(), 2);
    }

    #[test]
    fn outbound_events_fan_out_to_bound_queues() {
        let p = Pipeline::new(0);
        p.broker.bind("audit", "orgs-auths.topic");
        p.add_user("dev@acme.io");

        p.service
            .create_authorization(CreateAuthorizationDTO {
                user_email: "dev@acme.io".into(),
                org_uuid: p.organization,
                role: OrganizationRole::Support,
            })
            .unwrap();

        assert_eq!(p.broker.queue_len("audit"), 1);
    }
}
