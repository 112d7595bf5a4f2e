//! `cirrusd` — the connectivity and tunneling control-plane daemon.
//!
//! Entry point: load configuration, open the store, connect to the
//! system bus, wire up every component, spawn background workers, and
//! serve the HTTP control surface.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use cirrusd::apn::ApnManager;
use cirrusd::auth::{Auth, RealSystemControl};
use cirrusd::bus::BusClient;
use cirrusd::config::{AppConfig, CliFlags};
use cirrusd::data_bearer::DataBearer;
use cirrusd::http::{self, AppState};
use cirrusd::ipv6fwd::Ipv6Fwd;
use cirrusd::modem::Modem;
use cirrusd::rathole::RatholeController;
use cirrusd::sms::SmsEngine;
use cirrusd::store::{Store, StoreConfig, StorePath};
use cirrusd::time_provider::production_time_provider;
use cirrusd::usb_mode::{self, UsbMode};
use tokio::net::TcpListener;
use tracing::info;

const WATCHDOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let flags = CliFlags::parse();
    let config = AppConfig::load(&flags)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.log_level.parse()?),
        )
        .init();

    info!(bind = %config.bind, "starting cirrusd");

    let store_path = StorePath::new(&config.db_path)?;
    let store = Store::initialize(StoreConfig::new(store_path)).await?;

    let bus = BusClient::system(config.modem_bus_name.clone()).await?;

    let modem = Arc::new(Modem::new(bus.clone(), config.modem_object_path.clone()));
    let data_bearer = Arc::new(DataBearer::new(bus.clone(), config.modem_object_path.clone()));
    let sms = Arc::new(SmsEngine::new(
        bus.clone(),
        config.modem_object_path.clone(),
        store.clone(),
        Arc::clone(&modem),
    ));
    let apn = Arc::new(ApnManager::new(store.clone(), Arc::clone(&data_bearer)));
    let ipv6fwd = Arc::new(Ipv6Fwd::new(store.clone()));
    let rathole = Arc::new(RatholeController::new(
        store.clone(),
        config.rathole_log_path.clone(),
        config.rathole_pid_path.clone(),
        config.rathole_config_path.clone(),
        config.rathole_binary_path.clone(),
    ));
    let usb_mode = Arc::new(UsbMode::new(
        config.usb_mode_path.clone(),
        config.usb_mode_tmp_path.clone(),
        usb_mode::DEFAULT_GADGET_DIR,
    ));
    let auth = Arc::new(Auth::new(store.clone(), Arc::new(RealSystemControl)));

    tokio::spawn(Arc::clone(&data_bearer).run_monitor());
    tokio::spawn(Arc::clone(&data_bearer).run_watchdog(WATCHDOG_INTERVAL, production_time_provider()));
    tokio::spawn(Arc::clone(&sms).run_incoming_listener());
    tokio::spawn(Arc::clone(&sms).run_maintenance());
    tokio::spawn(Arc::clone(&ipv6fwd).run_periodic_reporter());

    if ipv6fwd.config().await?.auto_start {
        ipv6fwd.start().await?;
    }
    if rathole.config().await?.auto_start {
        rathole.start().await?;
    }

    let state = Arc::new(AppState { auth, modem, data_bearer, sms, apn, ipv6fwd, rathole, usb_mode });
    let app = http::build_router(state);

    let listener = TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, "HTTP control surface listening");
    axum::serve(listener, app).await?;

    Ok(())
}
