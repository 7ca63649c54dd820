#![deny(unsafe_code)]

use std::process;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use tidemq::auth::AllowHook;
use tidemq::codec::QoS;
use tidemq::conf::{Options, Settings};
use tidemq::hook::Type;
use tidemq::storage::{SledStore, StorageHook};
use tidemq::{logger, InlineClient, MqttServer, Result, ServerContext};

use self::observer::LogObserver;

mod observer;

const PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let settings = match Settings::new(Options::from_args()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("settings init failed, {:?}", e);
            process::exit(1);
        }
    };

    let guard = match logger::init(&settings.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logger init failed, {:?}", e);
            process::exit(1);
        }
    };
    settings.logs();

    let code = match run(settings).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("tidemq failed, {:?}", e);
            1
        }
    };
    drop(guard);
    process::exit(code);
}

async fn run(settings: Settings) -> Result<()> {
    let store = Arc::new(SledStore::open(&settings.store)?);
    let scx = ServerContext::builder().settings(settings.clone()).store(store.clone()).build();

    let register = scx.hooks.register();
    register.add_gate(&Type::GATE_ALL, 100, Arc::new(AllowHook)).await?;
    register.add_observe(&LogObserver::TYPES, 100, Arc::new(LogObserver)).await?;
    register.start().await;
    StorageHook::new(store).register(&scx.hooks.register()).await?;

    scx.load().await?;

    let server = MqttServer::new(scx.clone()).configured()?.build();
    server.start();

    let inline = InlineClient::new(&scx, "inline");
    inline.publish("direct/retained", "retained message", true, QoS::AtMostOnce).await?;
    let ticker = tokio::spawn(periodic(inline));

    shutdown_signal().await;
    log::info!("caught signal, stopping...");
    ticker.abort();
    server.shutdown().await?;

    if settings.opts.ephemeral {
        let dir = settings.store.dir.trim();
        if let Err(e) = std::fs::remove_dir_all(dir) {
            log::warn!("remove store dir {} failed, {:?}", dir, e);
        }
    }
    log::info!("stopped");
    Ok(())
}

async fn periodic(inline: InlineClient) {
    let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
    let mut seq: u64 = 0;
    loop {
        ticker.tick().await;
        seq += 1;
        if let Err(e) = inline.publish("direct/publish", format!("message {}", seq), false, QoS::AtMostOnce).await {
            log::warn!("inline publish failed, {:?}", e);
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("SIGTERM handler unavailable, {:?}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
