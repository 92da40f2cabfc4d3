//! Plugbus - message-bus plugin runtime
//!
//! Small command-line front end for inspecting settings, sending intents to a
//! fresh bus and running a fusion demo.

use anyhow::Context;
use clap::{Parser, Subcommand};
use plugbus::{
    BusSettings, ChannelTransport, FusionConfig, Message, MessageBus, PluginSpec, TransportError,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Plugbus - plugins talking over a message bus
#[derive(Parser, Debug)]
#[command(name = "plugbus")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Settings file (defaults to the XDG config location)
    #[arg(long, global = true, env = "PLUGBUS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug)
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Enable verbose logging (equivalent to RUST_LOG=trace)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective settings as JSON
    Config {
        /// Write the default settings file instead (never overwrites)
        #[arg(long)]
        init: bool,
    },

    /// Create plugins on one bus, fuse it into another and print the result
    Demo {
        /// Number of counter plugins to create on the source bus
        #[arg(long, default_value_t = 3)]
        plugins: usize,
    },

    /// Send one intent to a fresh bus and print the result
    Intent {
        /// Intent name (e.g. system.stats)
        name: String,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let default_filter = if args.verbose {
            "trace"
        } else if args.debug {
            "debug"
        } else {
            "warn" // Quiet by default for normal use
        };

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();

        if args.debug || args.verbose {
            tracing::info!("Debug logging enabled");
        }

        if let Command::Config { init: true } = args.command {
            return init_settings(args.config.as_deref());
        }

        let settings = load_settings(args.config.as_deref())?;

        match args.command {
            Command::Config { .. } => print_json(&serde_json::to_value(&settings)?),
            Command::Demo { plugins } => run_demo(settings, plugins).await,
            Command::Intent { name, payload } => run_intent(settings, &name, payload.as_deref()).await,
        }
    })
}

/// An explicit path must exist; the default location may be absent.
fn load_settings(path: Option<&Path>) -> anyhow::Result<BusSettings> {
    match path {
        Some(path) => BusSettings::load_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Ok(BusSettings::load_or_default()),
    }
}

fn init_settings(path: Option<&Path>) -> anyhow::Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(BusSettings::default_path);
    if path.exists() {
        anyhow::bail!("Settings file already exists: {}", path.display());
    }
    BusSettings::default()
        .save_to_path(&path)
        .with_context(|| format!("Failed to write settings to {}", path.display()))?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_intent(settings: BusSettings, name: &str, payload: Option<&str>) -> anyhow::Result<()> {
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON")?,
        None => json!({}),
    };

    let bus = MessageBus::builder().settings(settings).build();
    let result = bus.send_intent(name, payload).await?;
    print_json(&result)
}

async fn run_demo(settings: BusSettings, plugins: usize) -> anyhow::Result<()> {
    let source = MessageBus::builder()
        .id("bus-source")
        .settings(settings.clone())
        .build();
    // Everything the target bus publishes also leaves through this channel.
    let outbound = Arc::new(ChannelTransport::from_settings(&settings));
    let mut outbound_rx = outbound.subscribe();
    let target = MessageBus::builder()
        .id("bus-target")
        .settings(settings)
        .transport(outbound)
        .build();

    // One root counter with the rest as its children.
    for i in 0..plugins {
        let mut spec = PluginSpec::new("counter").with_id(format!("counter-{i}"));
        if i > 0 {
            spec = spec.with_parent("counter-0");
        }
        source.create_plugin(spec).await?;
    }

    source
        .publish(Message::notice("demo.tick", json!({ "n": 1 })))
        .await;
    source
        .publish_batch(vec![
            Message::notice("plugin.heartbeat", json!({})),
            Message::notice("demo.tick", json!({ "n": 2 })),
        ])
        .await?;

    let fusion = source.fuse_with(&target, FusionConfig::default()).await;
    if let Some(error) = &fusion.error {
        anyhow::bail!("Fusion failed: {error}");
    }

    let mut received = 0;
    loop {
        match outbound_rx.try_recv() {
            Ok(Some(_)) => received += 1,
            Ok(None) => break,
            Err(TransportError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Outbound channel lagged; raise channel_capacity");
            }
            Err(e) => return Err(e.into()),
        }
    }

    print_json(&json!({
        "fusion": serde_json::to_value(&fusion)?,
        "outbound": received,
        "target": serde_json::to_value(target.get_stats())?,
        "hierarchy": serde_json::to_value(target.hierarchy_tree())?,
    }))
}
