//! CLI entry point for `piccolod`, the piccolo field spectrometer server.
//!
//! Wires the orchestration core (`piccolo-core`) and, when serving, the
//! JSON-RPC-over-HTTP transport adapter (`piccolo-server`) around a loaded
//! [`PiccoloConfig`].

mod system;

use clap::{Parser, Subcommand};
use serde_json::json;

use piccolo_core::config::PiccoloConfig;
use piccolo_core::coordinator::CycleCount;
use piccolo_core::dispatcher::{Command, Response};

#[derive(Parser)]
#[command(name = "piccolod")]
#[command(about = "piccolod — field spectrometer orchestration server")]
#[command(version = piccolo_core::VERSION)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "piccolo.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestration core and serve the JSON-RPC-over-HTTP
    /// transport adapter until interrupted.
    Serve {
        /// Listen host, overriding `jsonrpc.url`'s host component.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Listen port, overriding `jsonrpc.url`'s port component.
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Run one recording in-process, without starting the HTTP adapter,
    /// and exit once it completes.
    Record {
        /// Output subdirectory, relative to the configured data directory.
        #[arg(long, default_value = "run")]
        out_dir: String,

        /// Number of dark/light cycles to record (negative means infinite;
        /// infinite runs make more sense under `serve`, but are accepted
        /// here too).
        #[arg(long, default_value_t = 1)]
        n_cycles: i64,

        /// Seconds to wait between cycles.
        #[arg(long, default_value_t = 0.0)]
        delay: f64,
    },

    /// Print the component registry and exit, to sanity-check wiring.
    Components,
}

fn load_config(path: &str) -> PiccoloConfig {
    match PiccoloConfig::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("failed to load configuration from '{path}': {e}; using defaults");
            PiccoloConfig::defaults()
        }
    }
}

fn render(response: Response) -> String {
    let value = match response {
        Response::Ok(v) => json!({"status": "ok", "value": v}),
        Response::Nok(msg) => json!({"status": "nok", "message": msg}),
    };
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = load_config(&cli.config);

    let system = match system::build(&cfg) {
        Ok(system) => system,
        Err(e) => {
            log::error!("failed to start piccolo: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve { host, port } => {
            let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
            rt.block_on(async move {
                let dispatcher = system.dispatcher.clone();
                tokio::select! {
                    _ = piccolo_server::run_server(system.dispatcher, system.bus, &host, port) => {}
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("received interrupt, stopping");
                        let _ = dispatcher.send(Command::control("stop"));
                    }
                }
            });
        }
        Commands::Record { out_dir, n_cycles, delay } => {
            let n_cycles = if n_cycles < 0 { CycleCount::Infinite } else { CycleCount::Finite(n_cycles as u32) };
            let cmd = Command::new("coordinator", "record")
                .with_arg("outDir", out_dir)
                .with_arg(
                    "nCycles",
                    match n_cycles {
                        CycleCount::Finite(n) => n as i64,
                        CycleCount::Infinite => -1,
                    },
                )
                .with_arg("delay", delay);
            println!("{}", render(system.dispatcher.send(cmd)));

            // `record` only acknowledges that recording has started; the
            // cycles themselves run on the coordinator's own thread. Poll
            // status until recording finishes before tearing the system
            // down, so a one-shot CLI invocation actually waits for its
            // output files to be written.
            loop {
                std::thread::sleep(std::time::Duration::from_millis(200));
                match system.dispatcher.send(Command::new("coordinator", "status")) {
                    Response::Ok(v) if v.get("recording").and_then(|r| r.as_bool()) == Some(false) => break,
                    Response::Nok(_) => break,
                    _ => {}
                }
            }
            let _ = system.dispatcher.send(Command::control("stop"));
        }
        Commands::Components => {
            println!("{}", render(system.dispatcher.send(Command::control("components"))));
            let _ = system.dispatcher.send(Command::control("stop"));
        }
    }
}
