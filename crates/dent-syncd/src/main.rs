//! dent-syncd entry point.
//!
//! Intentionally thin: parse arguments, load configuration, set up
//! tracing, wire the context, and hand off to the scheduler. Exit codes:
//! 0 clean shutdown, 1 fatal configuration error, 2 persistent storage
//! (watermark or queue) unreadable.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use dent_crm::{CrmClient, CrmClientConfig};
use dent_model::SystemClock;
use dent_plans::PlanWriter;
use dent_reconcile::CrmPort;
use dent_source::{AppointmentSource, PgAppointmentSource};
use dent_syncd::scheduler::InitError;
use dent_syncd::{Scheduler, SyncContext};

#[derive(Parser, Debug)]
#[command(name = "dent-syncd", about = "Clinic appointment → CRM synchronization daemon")]
struct Args {
    /// Configuration file; may be given several times, later files
    /// override earlier ones.
    #[arg(long = "config", value_name = "PATH", required = true)]
    config: Vec<String>,
}

#[tokio::main]
async fn main() {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let code = run(Args::parse()).await;
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    let paths: Vec<&str> = args.config.iter().map(String::as_str).collect();
    let loaded = match dent_config::load_layered_yaml(&paths) {
        Ok(loaded) => loaded,
        Err(err) => {
            // Tracing is not up yet; this is the one direct stderr line.
            eprintln!("fatal configuration error: {err:#}");
            return 1;
        }
    };

    init_tracing(&loaded.settings.logging.level);
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    let settings = loaded.settings;

    let retry_delays = match settings.crm.parsed_retry_delays() {
        Ok(delays) => delays,
        Err(err) => {
            error!(%err, "retry delays invalid");
            return 1;
        }
    };

    let source = match PgAppointmentSource::connect_lazy(
        &settings.source.connect_url(),
        settings.sync.filial_id,
        settings.source.connection_timeout(),
        settings.source.query_timeout(),
    ) {
        Ok(source) => Arc::new(source),
        Err(err) => {
            error!(%err, "source connection url rejected");
            return 1;
        }
    };

    let crm = match CrmClient::new(CrmClientConfig {
        webhook_url: settings.crm.webhook_url.clone(),
        max_attempts: settings.crm.max_retries,
        retry_delays,
        rate_limit_per_sec: settings.crm.rate_limit,
        request_timeout: settings.crm.request_timeout(),
        external_id_field: settings.crm.external_id_field.clone(),
        plan_field: settings.crm.plan_field.clone(),
    }) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(%err, "crm client construction failed");
            return 1;
        }
    };

    let ctx = SyncContext {
        settings,
        clock: Arc::new(SystemClock),
        source: source as Arc<dyn AppointmentSource>,
        crm: Arc::clone(&crm) as Arc<dyn CrmPort>,
        plan_writer: crm as Arc<dyn PlanWriter>,
    };

    let scheduler = match Scheduler::new(ctx) {
        Ok(scheduler) => scheduler,
        Err(InitError::Storage(err)) => {
            error!(%err, "watermark or retry queue unreadable");
            return 2;
        }
        Err(InitError::Config(msg)) => {
            error!(%msg, "configuration error");
            return 1;
        }
    };

    scheduler
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    0
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
}
