mod api;
mod config;
mod validate;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use api::AppState;
use config::ServerConfig;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting workflow orchestrator server");

    let config = ServerConfig::from_env();
    let orchestrator = config.build_orchestrator()?;
    info!("Runtime initialized with {} task types", orchestrator.list_tasks().len());

    let app_state = web::Data::new(AppState {
        orchestrator: Arc::new(orchestrator),
    });

    info!("Server starting on http://{}", config.bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&config.bind_address)?
    .run()
    .await?;

    Ok(())
}
