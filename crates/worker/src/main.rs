//! orgauth worker: consumes authorization-sync queues, applies them through
//! the use cases, and publishes the resulting authorization events.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use orgauth_events::{
    ConnectionHandle, Connector, EventPublisher, InMemoryBroker, InMemoryConnector, JsonBodyParser,
};
use orgauth_infra::config::{BrokerKind, OrgAuthConfig};
use orgauth_infra::directory::{DirectorySeed, InMemoryDirectory};
use orgauth_infra::messaging::{EventConsumer, RedisConnector};
use orgauth_infra::store::{AuthorizationStore, InMemoryAuthorizationStore, PostgresAuthorizationStore};
use orgauth_infra::usecases::AuthorizationService;
use orgauth_infra::workers::ConsumerWorker;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let log_format = std::env::var("ORGAUTH_LOG_FORMAT").unwrap_or_default();
    orgauth_observability::init_with(orgauth_observability::LogFormat::parse(&log_format));

    let config = OrgAuthConfig::from_env().context("invalid configuration")?;

    // Not entered on this thread: the Postgres store calls `block_on` on it.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    match config.broker {
        BrokerKind::Memory => {
            warn!("ORGAUTH_BROKER=memory; messages stay inside this process");
            let broker = Arc::new(InMemoryBroker::new());
            for (queue, destinations) in &config.inbound_bindings {
                for destination in destinations {
                    broker.bind(queue, destination);
                }
            }
            run(&config, &runtime, InMemoryConnector::new(broker))
        }
        BrokerKind::Redis => {
            let bindings: HashMap<String, Vec<String>> =
                config.inbound_bindings.clone().into_iter().collect();
            let connector =
                RedisConnector::new(&config.redis_url, bindings, config.consumer_name.clone())
                    .context("invalid Redis URL")?;
            run(&config, &runtime, connector)
        }
    }
}

fn run<C: Connector + 'static>(
    config: &OrgAuthConfig,
    runtime: &Runtime,
    connector: C,
) -> anyhow::Result<()> {
    let connection = Arc::new(ConnectionHandle::new(connector));
    info!(
        broker = %connection.connector().describe(),
        queues = ?config.inbound_queues,
        republish_inbound = config.republish_inbound,
        "orgauth worker starting"
    );

    let publisher =
        Arc::new(EventPublisher::new(connection.clone()).with_retry_delay(config.publish_retry));
    let store = build_store(config, runtime)?;
    let directory = Arc::new(build_directory(config)?);

    let service = AuthorizationService::new(store, directory.clone(), directory.clone(), directory)
        .with_publisher(publisher, config.destinations.clone())
        .publish_message(config.republish_inbound);

    let mut workers = Vec::with_capacity(config.inbound_queues.len());
    for queue in &config.inbound_queues {
        if config.bindings_for(queue).is_empty() {
            warn!(queue = %queue, "inbound queue has no bound destinations");
        }
        let consumer = EventConsumer::new(
            connection.clone(),
            queue.clone(),
            Arc::new(JsonBodyParser),
            service.clone(),
        )
        .with_poll_timeout(config.poll_timeout)
        .with_reconnect_delay(config.reconnect_delay);

        let handle = ConsumerWorker::spawn(format!("consumer-{queue}"), consumer)
            .with_context(|| format!("failed to spawn consumer for {queue}"))?;
        workers.push(handle);
    }
    info!(workers = workers.len(), "orgauth worker running");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    for worker in workers {
        worker.shutdown();
    }
    connection.close();
    info!("orgauth worker stopped");
    Ok(())
}

fn build_store(
    config: &OrgAuthConfig,
    runtime: &Runtime,
) -> anyhow::Result<Arc<dyn AuthorizationStore>> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("ORGAUTH_DATABASE_URL not set; authorizations are kept in memory");
        return Ok(Arc::new(InMemoryAuthorizationStore::new()));
    };

    let store = PostgresAuthorizationStore::connect(url, runtime.handle().clone())
        .context("failed to connect to Postgres")?;
    store.ensure_schema().context("failed to create schema")?;
    info!("using Postgres authorization store");
    Ok(Arc::new(store))
}

fn build_directory(config: &OrgAuthConfig) -> anyhow::Result<InMemoryDirectory> {
    let Some(path) = config.directory_seed.as_deref() else {
        warn!("ORGAUTH_DIRECTORY_SEED not set; directory starts empty");
        return Ok(InMemoryDirectory::new());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let seed: DirectorySeed = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    info!(
        users = seed.users.len(),
        organizations = seed.organizations.len(),
        projects = seed.projects.len(),
        "directory seeded"
    );
    Ok(InMemoryDirectory::from_seed(seed))
}
