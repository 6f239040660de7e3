//! Wires a complete in-process system from [`PiccoloConfig`]: shutters,
//! spectrometer workers, the message bus, the output writer, the
//! acquisition coordinator, and the dispatcher they're all registered
//! under. Wires mock hardware drivers behind the same traits a real
//! deployment would implement.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use piccolo_core::config::PiccoloConfig;
use piccolo_core::coordinator::{self, SpectrometerEntry};
use piccolo_core::data_dir::DataDir;
use piccolo_core::dispatcher::{Component, Dispatcher, DispatcherHandle};
use piccolo_core::error::CoreError;
use piccolo_core::hardware::mock::{MockAltimeterDriver, MockGpsDriver, MockShutterDriver, MockSpectrometerDriver, MockStatusLed};
use piccolo_core::message::MessageBus;
use piccolo_core::output::{self, OutputPolicy};
use piccolo_core::shutter::ShutterController;
use piccolo_core::spectrometer;
use piccolo_core::spectrum::Direction;

/// Default pixel count for the mock spectrometer driver. A real deployment
/// would read this straight off the hardware driver instead.
const MOCK_PIXEL_COUNT: usize = 2048;

/// A minimal "instrument" component exposing the always-available verbs
/// (`ping`, `status`, `stop`) plus a small `info` reply.
struct InstrumentComponent;

impl Component for InstrumentComponent {
    fn execute(&mut self, command: &str, _kwargs: &HashMap<String, Value>) -> Result<Value, CoreError> {
        match command {
            "ping" => Ok(Value::String("pong".into())),
            "status" => Ok(Value::String("ok".into())),
            "info" => Ok(serde_json::json!({
                "hostname": hostname(),
                "version": piccolo_core::VERSION,
            })),
            other => Err(CoreError::UnknownCommand {
                component: "piccolo".into(),
                command: other.into(),
            }),
        }
    }

    fn stop(&mut self) {}
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "piccolo".to_string())
}

fn direction_of(channel_name: &str) -> Option<Direction> {
    match channel_name {
        "upwelling" => Some(Direction::Upwelling),
        "downwelling" => Some(Direction::Downwelling),
        _ => None,
    }
}

/// A live system: a handle to talk to the dispatcher plus the shared
/// message bus transport adapters subscribe to.
pub struct System {
    pub dispatcher: DispatcherHandle,
    pub bus: MessageBus,
}

/// Build and spawn every component thread, register them with a fresh
/// [`Dispatcher`], and spawn the dispatcher itself. Returns once everything
/// is running; the caller talks to it purely through the returned handles.
pub fn build(cfg: &PiccoloConfig) -> Result<System, CoreError> {
    let bus = MessageBus::spawn();

    let mount = if cfg.datadir.mount {
        Some(piccolo_core::data_dir::MountConfig {
            device: cfg.datadir.device.clone().into(),
            mount_point: cfg.datadir.mntpnt.clone().into(),
        })
    } else {
        None
    };
    let data_dir = Arc::new(DataDir::new(&cfg.datadir.datadir, mount)?);
    data_dir.datadir()?;

    let mut shutters: BTreeMap<Direction, Arc<ShutterController>> = BTreeMap::new();
    for (name, channel) in &cfg.channels {
        let Some(direction) = direction_of(name) else {
            warn!("channel '{name}' does not map to a known direction, skipping");
            continue;
        };
        if channel.shutter < 0 {
            info!("channel '{name}' has no shutter hardware attached (shutter = -1)");
        }
        let ctl = ShutterController::new(
            name.clone(),
            Arc::new(MockShutterDriver::default()),
            channel.reverse,
            channel.fibre_diameter as f64,
        );
        shutters.insert(direction, Arc::new(ctl));
    }
    if shutters.is_empty() {
        warn!("no configured channels mapped to upwelling/downwelling; using defaults");
        shutters.insert(Direction::Upwelling, Arc::new(ShutterController::new("upwelling", Arc::new(MockShutterDriver::default()), false, 600.0)));
        shutters.insert(Direction::Downwelling, Arc::new(ShutterController::new("downwelling", Arc::new(MockShutterDriver::default()), false, 600.0)));
    }

    let mut spectrometer_entries = Vec::new();
    if cfg.spectrometers.is_empty() {
        warn!("no configured spectrometers; wiring a single default mock 'S_A'");
        let driver = Box::new(MockSpectrometerDriver::new("S_A", MOCK_PIXEL_COUNT, 10, 2000));
        spectrometer_entries.push(SpectrometerEntry {
            name: "S_A".to_string(),
            handle: spectrometer::spawn("S_A", driver),
            min_ms: 10,
            max_ms: 2000,
        });
    } else {
        for (name, limits) in &cfg.spectrometers {
            let driver = Box::new(MockSpectrometerDriver::new(
                name.clone(),
                MOCK_PIXEL_COUNT,
                limits.min_integration_time,
                limits.max_integration_time,
            ));
            spectrometer_entries.push(SpectrometerEntry {
                name: name.clone(),
                handle: spectrometer::spawn(name.clone(), driver),
                min_ms: limits.min_integration_time,
                max_ms: limits.max_integration_time,
            });
        }
    }

    let output_handle = output::spawn(
        OutputPolicy {
            clobber: cfg.output.clobber,
            split: cfg.output.split,
            pretty: cfg.output.pretty,
        },
        Some(bus.clone()),
    );

    let gps = Arc::new(MockGpsDriver::default());
    let altimeter = Arc::new(MockAltimeterDriver::default());
    let led = Arc::new(MockStatusLed::default());

    let coordinator_handle = coordinator::spawn(
        shutters,
        spectrometer_entries,
        bus.clone(),
        output_handle,
        data_dir,
        gps,
        altimeter,
        led,
    );

    let mut dispatcher = Dispatcher::new();
    dispatcher.set_message_bus(bus.clone());
    dispatcher.register_component("piccolo", Box::new(InstrumentComponent));
    dispatcher.register_component("coordinator", Box::new(coordinator_handle));

    let handle = dispatcher.register_client();
    dispatcher.spawn();

    Ok(System { dispatcher: handle, bus })
}
