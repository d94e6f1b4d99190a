use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use sluice_manager::api::{self, ServerState};
use sluice_manager::exports::ExportStore;
use sluice_manager::logging::init_logging;
use sluice_manager::{ManagerConfig, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(ManagerConfig::parse());
    init_logging("sluice-manager".green(), config.debug);

    let exports = Arc::new(ExportStore::default());
    let supervisor = Arc::new(Mutex::new(
        Supervisor::new(config.clone(), exports.clone()).context("starting the supervisor")?,
    ));

    // Periodic sweep: reap dead workers, expire timed-out layers.
    {
        let supervisor = supervisor.clone();
        let period = Duration::from_secs(config.sweep_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                supervisor.lock().await.sweep().await;
            }
        });
    }

    let bind = (config.bind_address.clone(), config.port);
    log::info!("listening on {}:{}", bind.0, bind.1);
    let state_supervisor = supervisor.clone();
    let state_exports = exports.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(ServerState {
                supervisor: state_supervisor.clone(),
                exports: state_exports.clone(),
            }))
            .configure(api::configure)
    })
    .bind(bind)
    .context("binding the HTTP server")?
    .run()
    .await
    .context("running the HTTP server")?;

    // Leave nothing running past the server.
    let _ = supervisor.lock().await.stop_all().await;
    Ok(())
}
