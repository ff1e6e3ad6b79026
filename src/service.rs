use std::{sync::Arc, time::Duration};

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions, SqliteSynchronous,
    },
    SqlitePool,
};

use crate::{
    config::Config,
    consumer::{Consumer, ForwardHandler},
    dispatch::{BatchOutcome, Dispatcher, UpdateBatch},
    error::Error,
    message::{Message, MessageStatus},
    store::{QueueStats, QueueStore},
    transport::Transport,
};

pub struct Service {
    store: QueueStore,
    dispatcher: Dispatcher,
    transport: Option<Arc<dyn Transport>>,
    config: Config,
}

async fn connect_pool(config: &Config) -> Result<SqlitePool, Error> {
    let opts = SqliteConnectOptions::new()
        .filename(config.db_path())
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

    Ok(SqlitePoolOptions::new().connect_with(opts).await?)
}

#[bon::bon]
impl Service {
    /// Opens the database, runs migrations and selects the dispatch route.
    #[builder]
    pub async fn connect_with(
        config: Config,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let pool = connect_pool(&config).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let store = QueueStore::new(pool);
        let dispatcher = Dispatcher::from_config(&config, store.clone(), transport.clone())?;

        tracing::info!(
            db_path = config.db_path(),
            route = dispatcher.route_name(),
            "Service connected"
        );

        Ok(Self {
            store,
            dispatcher,
            transport,
            config,
        })
    }
}

impl Service {
    pub fn db(&self) -> &SqlitePool {
        self.store.db()
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dispatches a batch using the configured chunk size.
    pub async fn dispatch(&self, batch: &UpdateBatch) -> Result<BatchOutcome, Error> {
        if batch.case_references.iter().any(|case| case.trim().is_empty()) {
            return Err(Error::invalid_parameter("case references must not be blank"));
        }

        self.dispatcher
            .send_batch(batch, self.config.chunk_size())
            .await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message, Error> {
        self.store
            .get(message_id)
            .await?
            .ok_or_else(|| Error::message_not_found(message_id))
    }

    pub async fn stats(&self) -> Result<QueueStats, Error> {
        self.store.stats().await
    }

    /// Puts a failed message back in the queue.
    pub async fn requeue_failed(&self, message_id: &str) -> Result<(), Error> {
        if self.store.requeue_failed(message_id).await? {
            return Ok(());
        }

        let message = self.get_message(message_id).await?;
        Err(Error::InvalidTransition {
            message_id: message_id.to_owned(),
            status: message.status,
            target: MessageStatus::Pending,
        })
    }

    /// A consumer relaying the fallback queue to the broker, when both are
    /// configured and consumption is enabled.
    pub fn relay_consumer(&self) -> Result<Option<Consumer<ForwardHandler>>, Error> {
        if !self.config.queue_enabled() || !self.config.consumer_enabled() {
            return Ok(None);
        }

        let Some(transport) = self.transport.clone() else {
            return Ok(None);
        };
        let handler = ForwardHandler::new(transport, self.config.send_timeout());

        Consumer::from_config(&self.config, self.store.clone(), handler).map(Some)
    }
}
