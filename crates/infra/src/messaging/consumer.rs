//! Event consumer.
//!
//! One delivery at a time per consumer: parse, route to a use case, then ack
//! or reject. Acks happen only after the use case (and anything it
//! published) returned.
//!
//! ## Outcomes
//!
//! - success: ack
//! - body cannot be parsed or routed: reject without requeue
//! - referenced user/organization/project missing: reject without requeue
//! - permission failure (self-modification): reject without requeue
//! - anything else: reject without requeue, logged at `error`
//!
//! Nothing is requeued. A retry cannot fix any of the above, and replays of
//! acked messages are absorbed by the idempotent use cases.
//!
//! A delivery whose ack/reject fails is not counted: its channel is released,
//! the broker hands the message out again, and it is settled on the replay.
//!
//! A `user` create/update carries the account state reported by the identity
//! service; it is recorded in the user directory before invites are
//! materialized or the 2FA flag is resynced.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use orgauth_auth::{OrganizationRole, ProjectRole};
use orgauth_events::{
    Action, AuthorizationEvent, BodyParser, ChannelError, ConnectionHandle, Connector, Delivery,
    EntityKind, MessageChannel, ParseError,
};

use crate::usecases::{
    AuthorizationService, CreateAuthorizationDTO, CreateProjectAuthorizationDTO,
    DeleteAuthorizationDTO, DeleteProjectAuthorizationDTO, UpdateAuthorizationDTO,
    UpdateProjectAuthorizationDTO, UseCaseError, UseCaseResult,
};

/// What happened to one delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    RejectedMalformed,
    RejectedMissingEntity,
    RejectedForbidden,
    RejectedUnexpected,
}

impl DeliveryOutcome {
    pub fn is_ack(self) -> bool {
        matches!(self, DeliveryOutcome::Acknowledged)
    }
}

/// Running per-consumer counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acknowledged: AtomicU64,
    rejected_malformed: AtomicU64,
    rejected_missing_entity: AtomicU64,
    rejected_forbidden: AtomicU64,
    rejected_unexpected: AtomicU64,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ConsumerCounts {
    pub acknowledged: u64,
    pub rejected_malformed: u64,
    pub rejected_missing_entity: u64,
    pub rejected_forbidden: u64,
    pub rejected_unexpected: u64,
}

impl ConsumerCounts {
    pub fn rejected(&self) -> u64 {
        self.rejected_malformed
            + self.rejected_missing_entity
            + self.rejected_forbidden
            + self.rejected_unexpected
    }
}

impl ConsumerStats {
    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Acknowledged => &self.acknowledged,
            DeliveryOutcome::RejectedMalformed => &self.rejected_malformed,
            DeliveryOutcome::RejectedMissingEntity => &self.rejected_missing_entity,
            DeliveryOutcome::RejectedForbidden => &self.rejected_forbidden,
            DeliveryOutcome::RejectedUnexpected => &self.rejected_unexpected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerCounts {
        ConsumerCounts {
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            rejected_malformed: self.rejected_malformed.load(Ordering::Relaxed),
            rejected_missing_entity: self.rejected_missing_entity.load(Ordering::Relaxed),
            rejected_forbidden: self.rejected_forbidden.load(Ordering::Relaxed),
            rejected_unexpected: self.rejected_unexpected.load(Ordering::Relaxed),
        }
    }
}

/// A routed inbound event, ready for the matching use case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    CreateOrganization(CreateAuthorizationDTO),
    UpdateOrganization(UpdateAuthorizationDTO),
    DeleteOrganization(DeleteAuthorizationDTO),
    CreateProject(CreateProjectAuthorizationDTO),
    UpdateProject(UpdateProjectAuthorizationDTO),
    DeleteProject(DeleteProjectAuthorizationDTO),
    UserRegistered { email: String, has_2fa: Option<bool> },
    UserUpdated { email: String, has_2fa: Option<bool> },
}

/// Map a parsed event onto a use case call.
///
/// `create`/`update` carry a grantable role; the target UUID matching the
/// entity must be present.
pub fn route(event: AuthorizationEvent) -> Result<InboundCommand, ParseError> {
    let entity = event.target_entity().ok_or_else(|| {
        ParseError::InvalidCombination(format!("{} without a target entity", event.action))
    })?;

    let command = match (entity, event.action) {
        (EntityKind::User, Action::Create) => InboundCommand::UserRegistered {
            email: event.user_email,
            has_2fa: event.has_2fa,
        },
        (EntityKind::User, Action::Update) => InboundCommand::UserUpdated {
            email: event.user_email,
            has_2fa: event.has_2fa,
        },
        (EntityKind::User, Action::Delete) => {
            return Err(ParseError::InvalidCombination("delete on user".to_string()));
        }

        (EntityKind::Organization, action) => {
            let org_uuid = event
                .organization_id()
                .ok_or_else(|| ParseError::invalid_field("organization_uuid", "missing"))?;
            match action {
                Action::Create => InboundCommand::CreateOrganization(CreateAuthorizationDTO {
                    org_uuid,
                    role: organization_role(event.role)?,
                    user_email: event.user_email,
                }),
                Action::Update => InboundCommand::UpdateOrganization(UpdateAuthorizationDTO {
                    org_uuid,
                    role: organization_role(event.role)?,
                    request_user: event.request_user,
                    id: None,
                    user_email: Some(event.user_email),
                }),
                Action::Delete => InboundCommand::DeleteOrganization(DeleteAuthorizationDTO {
                    org_uuid,
                    request_user: event.request_user,
                    id: None,
                    user_email: Some(event.user_email),
                }),
            }
        }

        (EntityKind::Project, action) => {
            let project_uuid = event
                .project_id()
                .ok_or_else(|| ParseError::invalid_field("project_uuid", "missing"))?;
            match action {
                Action::Create => InboundCommand::CreateProject(CreateProjectAuthorizationDTO {
                    project_uuid,
                    role: project_role(event.role)?,
                    created_by_email: event.created_by,
                    user_email: event.user_email,
                }),
                Action::Update => InboundCommand::UpdateProject(UpdateProjectAuthorizationDTO {
                    project_uuid,
                    role: project_role(event.role)?,
                    request_user: event.request_user,
                    user_email: event.user_email,
                }),
                Action::Delete => InboundCommand::DeleteProject(DeleteProjectAuthorizationDTO {
                    project_uuid,
                    request_user: event.request_user,
                    user_email: event.user_email,
                }),
            }
        }
    };

    Ok(command)
}

fn required_role(role: Option<i64>) -> Result<i64, ParseError> {
    role.ok_or_else(|| ParseError::invalid_field("role", "required for create/update"))
}

fn organization_role(role: Option<i64>) -> Result<OrganizationRole, ParseError> {
    OrganizationRole::try_from(required_role(role)?)
        .and_then(OrganizationRole::ensure_grantable)
        .map_err(|e| ParseError::invalid_field("role", e.to_string()))
}

fn project_role(role: Option<i64>) -> Result<ProjectRole, ParseError> {
    ProjectRole::try_from(required_role(role)?)
        .and_then(ProjectRole::ensure_grantable)
        .map_err(|e| ParseError::invalid_field("role", e.to_string()))
}

pub struct EventConsumer<C: Connector> {
    connection: Arc<ConnectionHandle<C>>,
    queue: String,
    parser: Arc<dyn BodyParser>,
    service: AuthorizationService,
    poll_timeout: Duration,
    reconnect_delay: Duration,
    stats: Arc<ConsumerStats>,
}

impl<C: Connector> EventConsumer<C> {
    pub fn new(
        connection: Arc<ConnectionHandle<C>>,
        queue: impl Into<String>,
        parser: Arc<dyn BodyParser>,
        service: AuthorizationService,
    ) -> Self {
        Self {
            connection,
            queue: queue.into(),
            parser,
            service,
            poll_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Wait up to the poll timeout for one delivery and settle it.
    ///
    /// `Ok(None)` means nothing arrived. On a transport error the channel used
    /// for this poll is released (its unsettled deliveries go back to the
    /// broker) before the error is returned; a newer channel opened meanwhile
    /// by a publisher is left alone.
    pub fn poll_once(&self) -> Result<Option<DeliveryOutcome>, ChannelError> {
        let channel = self.connection.ensure_connected()?;
        let result = channel
            .next_delivery(&self.queue, self.poll_timeout)
            .and_then(|delivery| match delivery {
                Some(delivery) => self.process_one(channel.as_ref(), delivery).map(Some),
                None => Ok(None),
            });

        if let Err(err) = &result {
            if err.is_transport() {
                self.connection.release(&channel);
            }
        }
        result
    }

    /// Apply one delivery and ack/reject it on the channel it came from.
    #[instrument(
        skip(self, channel, delivery),
        fields(queue = %delivery.queue, delivery_tag = %delivery.tag, redelivered = delivery.redelivered)
    )]
    pub fn process_one(
        &self,
        channel: &C::Channel,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome, ChannelError> {
        let outcome = match self.parser.parse(delivery.body()).and_then(route) {
            Err(err) => {
                warn!(error = %err, "malformed message dead-lettered");
                DeliveryOutcome::RejectedMalformed
            }
            Ok(command) => match self.execute(command) {
                Ok(()) => DeliveryOutcome::Acknowledged,
                Err(err) => classify(&err),
            },
        };

        let settled = if outcome.is_ack() {
            channel.ack(&delivery)
        } else {
            channel.reject(&delivery, false)
        };
        if let Err(err) = settled {
            warn!(outcome = ?outcome, error = %err, "delivery not settled; awaiting redelivery");
            return Err(err);
        }
        self.stats.record(outcome);
        debug!(outcome = ?outcome, "delivery settled");
        Ok(outcome)
    }

    fn execute(&self, command: InboundCommand) -> UseCaseResult<()> {
        let service = &self.service;
        match command {
            InboundCommand::CreateOrganization(dto) => service.create_authorization(dto).map(drop),
            InboundCommand::UpdateOrganization(dto) => service.update_authorization(dto).map(drop),
            InboundCommand::DeleteOrganization(dto) => service.delete_authorization(dto).map(drop),
            InboundCommand::CreateProject(dto) => {
                service.create_project_authorization(dto).map(drop)
            }
            InboundCommand::UpdateProject(dto) => {
                service.update_project_authorization(dto).map(drop)
            }
            InboundCommand::DeleteProject(dto) => {
                service.delete_project_authorization(dto).map(drop)
            }
            InboundCommand::UserRegistered { email, has_2fa } => {
                let materialized = service.register_user(&email, has_2fa)?;
                info!(
                    user_email = %email,
                    organizations = materialized.organizations.len(),
                    projects = materialized.projects.len(),
                    "registration applied"
                );
                Ok(())
            }
            InboundCommand::UserUpdated { email, has_2fa } => {
                service.record_user_update(&email, has_2fa).map(drop)
            }
        }
    }
}

fn classify(err: &UseCaseError) -> DeliveryOutcome {
    if err.is_not_found() {
        warn!(error = %err, "referenced entity missing; message dead-lettered");
        DeliveryOutcome::RejectedMissingEntity
    } else if err.is_permission() {
        warn!(error = %err, "permission denied; message dead-lettered");
        DeliveryOutcome::RejectedForbidden
    } else {
        error!(error = %err, "unexpected failure applying message; dead-lettered");
        DeliveryOutcome::RejectedUnexpected
    }
}

impl<C: Connector> core::fmt::Debug for EventConsumer<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("queue", &self.queue)
            .field("poll_timeout", &self.poll_timeout)
            .field("counts", &self.stats.snapshot())
            .finish()
    }
}
