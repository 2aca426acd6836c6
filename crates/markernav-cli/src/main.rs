//! `markernav` – marker-following robot controller
//!
//! This binary is the entry point for the whole stack.  It:
//!
//! 1. Loads `~/.markernav/config.toml` (writing the defaults on first run) and
//!    applies `MARKERNAV_*` environment overrides.
//! 2. Starts the rosbridge WebSocket server so a ROS graph (or simulator) can
//!    stream `/aruco_markers`, `/tf` and `/tf_static` in and read `/cmd_vel`
//!    out.
//! 3. Runs the follower node until **Ctrl-C**, then publishes a final stop
//!    command before exiting.

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use colored::Colorize;
use tracing::{error, info};

use markernav_hal::SystemClock;
use markernav_middleware::{EventBus, RosBridge};
use markernav_runtime::{FollowerNode, init_tracing};
use markernav_types::NavError;

fn main() {
    // RUST_LOG filters (default "info"); MARKERNAV_LOG_FORMAT=json switches to
    // JSON lines; OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let telemetry = init_tracing("markernav");

    print_banner();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| NavError::Config(format!("failed to start the Tokio runtime: {e}")))
        .and_then(|rt| rt.block_on(run()));

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "fatal error");
            println!("{}: {}", "Error".red().bold(), e);
            1
        }
    };

    // Flush spans before exiting; process::exit skips destructors.
    drop(telemetry);
    std::process::exit(code);
}

async fn run() -> Result<(), NavError> {
    let path = config::config_path();
    let (cfg, created) = config::load_or_init(&path)?;
    if created {
        println!(
            "  {} default config written to {}",
            "✓".green(),
            path.display().to_string().bold()
        );
    } else {
        println!("  Config loaded from {}", path.display().to_string().bold());
    }
    println!(
        "  Following {} in {} every {} ms",
        cfg.node.marker_frame().bold(),
        cfg.node.base_frame.bold(),
        cfg.node.tick_period_ms
    );

    let bus = EventBus::default();
    let clock = Arc::new(SystemClock::new());

    if cfg.bridge.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.bridge.port));
        let bridge = RosBridge::new(bus.clone(), clock.clone());
        println!("  rosbridge listening on {}", format!("ws://{addr}").cyan());
        tokio::spawn(async move {
            if let Err(e) = bridge.run_ws_server(addr).await {
                error!(error = %e, "rosbridge server failed");
            }
        });
    } else {
        println!("  {}", "rosbridge disabled".dimmed());
    }

    let node = FollowerNode::new(cfg.node, bus, clock).await?;
    println!("  Press {} to stop.\n", "Ctrl-C".bold());

    node.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C; stopping");
        }
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the robot …".yellow().bold());
    })
    .await?;

    println!("{}", "  ✓ Stop command published.".green());
    info!("markernav exited cleanly");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __  ___         __           _  __         "#.bold().cyan());
    println!("{}", r#"  /  |/  /__ _____/ /_____ ____/ |/ /__ __  __"#.bold().cyan());
    println!("{}", r#" / /|_/ / _ `/ __/  '_/ -_) __/    / _ `/ |/ /"#.bold().cyan());
    println!("{}", r#"/_/  /_/\_,_/_/ /_/\_\\__/_/ /_/|_/\_,_/|___/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "MarkerNav".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Fiducial marker follower");
    println!();
}
