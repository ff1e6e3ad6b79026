use std::{future::Future, sync::Arc};

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use config::Config;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};
use transport::Transport;

pub mod api;
pub mod config;
pub mod consumer;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod service;
pub mod store;
pub mod transport;

/// Returns a builder for the main application.
///
/// `transport_factory` receives the loaded configuration and returns the
/// broker transport, if one is available.
#[bon::builder(finish_fn = start)]
pub async fn run<T, F>(transport_factory: T) -> eyre::Result<()>
where
    T: FnOnce(Config) -> F,
    F: Future<Output = Option<Arc<dyn Transport>>>,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("CASEQUEUE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("CASEQUEUE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    let bind_addr = config.bind_addr();

    let transport = transport_factory(config.clone()).await;

    let service = service::Service::connect_with()
        .config(config)
        .maybe_transport(transport)
        .call()
        .await?;

    let cancel = CancellationToken::new();
    let consumer = service
        .relay_consumer()?
        .map(|consumer| tokio::spawn(consumer.run(cancel.clone())));

    let data = Data::new(service);

    let server = HttpServer::new(move || {
        let json_cfg = JsonConfig::default().content_type_required(false);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .service(api::dispatch::service())
            .service(api::messages::service())
            .app_data(data.clone())
            .app_data(json_cfg)
    })
    .bind(bind_addr)?
    .run();

    tracing::info!(%bind_addr, "Listening");

    let res = server.await;

    cancel.cancel();
    if let Some(consumer) = consumer {
        consumer.await?;
    }

    Ok(res?)
}
