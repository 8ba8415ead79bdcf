//! Example plugin serving a handful of functions over stdio.
//!
//! Spawned by a master via `Controller::load_plugin`. Stdout carries the wire,
//! so all logging goes to stderr.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use plugwire::{Controller, Plugin, values};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PLUGWIRE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("plugwire={level},plugwire_echo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn build_controller(peer: Arc<OnceLock<Plugin>>) -> plugwire::Result<Controller> {
    let mut controller = Controller::new();

    controller.register_function("add", |a: i64, b: i64| a + b)?;
    controller.register_function("echo", |text: String| text)?;
    controller.register_function("greet", |name: String| format!("hello, {name}"))?;
    controller.register_variadic("join", |sep: String, parts: Vec<String>| parts.join(&sep))?;
    controller.register_function("sleep_ms", |ms: u64| {
        std::thread::sleep(Duration::from_millis(ms));
        ms
    })?;
    controller.register_function("fail", |reason: String| -> Result<(), String> {
        Err(reason)
    })?;

    // Lives in the master; the local definition declares its wire types.
    controller.register_function("hello", |name: String| name)?;

    // Calls back into the master while the master's call is still in flight.
    // `peer` holds the connection, which holds this controller: the cycle lives
    // as long as the process does.
    controller.register_function("relay", move |name: String| -> Result<String, String> {
        let plugin = peer
            .get()
            .ok_or_else(|| "connection not ready".to_string())?;
        let out = tokio::runtime::Handle::current()
            .block_on(plugin.invoke("hello", values![name]))
            .map_err(|e| e.to_string())?;
        out.take::<String>(0)
            .ok_or_else(|| "hello did not return a string".to_string())
    })?;

    Ok(controller)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let peer = Arc::new(OnceLock::new());
    let controller = build_controller(Arc::clone(&peer)).context("failed to register functions")?;
    tracing::info!(functions = ?controller.functions().ids(), "Serving on stdio");

    let plugin = controller.serve_stdio().context("failed to serve on stdio")?;
    let _ = peer.set(plugin.clone());

    plugin.wait().await.context("connection failed")?;
    tracing::info!("Master closed the connection, exiting");
    Ok(())
}
