//! Engine entry point — CLI wiring and demo harness construction.
//!
//! Runs the allocation engine against in-process reference resource
//! managers, one per configured device, so a plain `cargo run` shows the
//! negotiation and allocation decisions on stdout.

use std::path::Path;
use std::process;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use surplus_ems::config::EmsConfig;
use surplus_ems::engine::{AllocationScheduler, EngineState, SystemSnapshot};
use surplus_ems::protocol::LocalBus;
use surplus_ems::rm::ReferenceRm;

/// Parsed CLI arguments.
struct CliArgs {
    config_path: Option<String>,
    ticks: u64,
    #[cfg(feature = "api")]
    serve: bool,
    #[cfg(feature = "api")]
    port: u16,
}

fn print_help() {
    eprintln!("surplus-ems — phase-aware surplus power allocator");
    eprintln!();
    eprintln!("Usage: surplus-ems [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>          Load configuration from TOML file");
    eprintln!("  --ticks <n>              Stop after n control cycles (0 = run forever)");
    #[cfg(feature = "api")]
    {
        eprintln!("  --serve                  Serve the read API while running");
        eprintln!("  --port <u16>             API server port (default: 3000)");
    }
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("Without --config, a built-in demo setup with one EV charger is used.");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        ticks: 24,
        #[cfg(feature = "api")]
        serve: false,
        #[cfg(feature = "api")]
        port: 3000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --config requires a path argument");
                    process::exit(1);
                }
                cli.config_path = Some(args[i].clone());
            }
            "--ticks" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --ticks requires a u64 argument");
                    process::exit(1);
                }
                if let Ok(n) = args[i].parse::<u64>() {
                    cli.ticks = n;
                } else {
                    eprintln!("error: --ticks value \"{}\" is not a valid u64", args[i]);
                    process::exit(1);
                }
            }
            #[cfg(feature = "api")]
            "--serve" => {
                cli.serve = true;
            }
            #[cfg(feature = "api")]
            "--port" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --port requires a u16 argument");
                    process::exit(1);
                }
                if let Ok(p) = args[i].parse::<u16>() {
                    cli.port = p;
                } else {
                    eprintln!("error: --port value \"{}\" is not a valid u16", args[i]);
                    process::exit(1);
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

/// A sunny afternoon: three-phase PV surplus, battery mostly full.
fn demo_snapshot() -> SystemSnapshot {
    SystemSnapshot {
        pv_on_grid_w: [2000.0, 2000.0, 2000.0],
        consumption_w: [300.0, 250.0, 350.0],
        battery_power_w: 1200.0,
        battery_soc: Some(0.85),
        battery_voltage_v: 48.0,
        grid_tied: Some(true),
        phase_count: Some(3),
        feed_in_allowed: Some(true),
        ..SystemSnapshot::default()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = parse_args();

    // Load config: --config takes priority, otherwise the built-in demo.
    let config = if let Some(ref path) = cli.config_path {
        match EmsConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        EmsConfig::demo()
    };

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    let bus = LocalBus::new();
    let mut inbox = bus.attach(&config.engine.client_id);

    // One in-process reference RM per configured device.
    for device in &config.devices {
        let rm_inbox = bus.attach(&device.rm_id);
        let rm = ReferenceRm::ev_charger(
            device.rm_id.clone(),
            config.engine.client_id.clone(),
            Arc::new(bus.clone()),
        );
        tokio::spawn(rm.run(rm_inbox));
    }

    let mut scheduler = AllocationScheduler::from_config(&config, Arc::new(bus.clone()));
    let (state_tx, _state_rx) = watch::channel(EngineState::default());

    #[cfg(feature = "api")]
    if cli.serve {
        use std::net::SocketAddr;

        let app_state = Arc::new(surplus_ems::api::AppState {
            state_rx: _state_rx.clone(),
        });
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
        tokio::spawn(surplus_ems::api::serve(app_state, addr));
    }

    scheduler.start(Instant::now());
    let snapshot = demo_snapshot();
    let mut interval = time::interval(config.engine.tick_interval());
    let mut completed = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outcome = scheduler.tick(&snapshot, Instant::now());
                debug!(?outcome, "control cycle finished");
                let state = scheduler.published().clone();
                println!("{state}");
                let _ = state_tx.send(state);
                completed += 1;
                if cli.ticks > 0 && completed >= cli.ticks {
                    break;
                }
            }
            Some(envelope) = inbox.recv() => {
                scheduler.handle_envelope(&envelope, Instant::now());
            }
        }
    }
}
