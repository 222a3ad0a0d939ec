//! Terminal front end for the BLE telemetry core.
//!
//! Scans for peripherals, connects to one and prints its telemetry as it
//! arrives. All BLE work goes through the btleplug platform; this file only
//! feeds events to the monitor and renders what it reports.

mod ble_platform;
mod display;

use std::time::Duration;

use anyhow::{anyhow, Result};
use ble_telemetry::config::{scan, telemetry as telemetry_config};
use ble_telemetry::telemetry;
use ble_telemetry::discovery::DiscoveryRegistry;
use ble_telemetry::{
    MonitorConfig, MonitorError, PeripheralId, PlatformEvent, RegistryPolicy, ScanSettings, TelemetryMonitor,
    Update,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use ble_platform::BtleplugPlatform;

/// How long to wait for the platform to confirm a disconnect on exit
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "telemetry-monitor")]
#[command(about = "Scan for BLE peripherals and stream their telemetry")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan once and list named peripherals
    Scan {
        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Connect to a peripheral and print its telemetry until Ctrl-C
    Watch {
        /// Advertised name or identity of the peripheral
        target: String,

        #[command(flatten)]
        scan: ScanArgs,

        /// Service carrying the telemetry characteristic
        #[arg(long, default_value_t = telemetry_config::SERVICE_UUID)]
        service: Uuid,

        /// Characteristic that notifies telemetry payloads
        #[arg(long, default_value_t = telemetry_config::CHARACTERISTIC_UUID)]
        characteristic: Uuid,

        /// Keep peripherals from earlier scan windows
        #[arg(long)]
        persist: bool,
    },

    /// Decode one payload, e.g. "12|345.6|22|1"
    Decode { payload: String },
}

#[derive(clap::Args)]
struct ScanArgs {
    /// Scan window in seconds
    #[arg(short, long, default_value_t = scan::DURATION_SECS)]
    duration: u16,

    /// Report only the first advertisement of each peripheral
    #[arg(long)]
    no_duplicates: bool,

    /// Only report peripherals advertising this service (repeatable)
    #[arg(long = "filter")]
    filters: Vec<Uuid>,
}

impl ScanArgs {
    fn settings(&self) -> Result<ScanSettings> {
        let mut services = heapless::Vec::new();
        for uuid in &self.filters {
            services
                .push(*uuid)
                .map_err(|_| anyhow!("At most {} service filters", scan::MAX_SERVICE_FILTERS))?;
        }

        Ok(ScanSettings {
            services,
            duration_secs: self.duration,
            allow_duplicates: !self.no_duplicates,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let args = Args::parse();

    match args.command {
        Command::Scan { scan } => run_scan(&scan).await,
        Command::Watch {
            target,
            scan,
            service,
            characteristic,
            persist,
        } => {
            let config = MonitorConfig {
                scan: scan.settings()?,
                registry_policy: if persist {
                    RegistryPolicy::Persist
                } else {
                    RegistryPolicy::ClearOnScan
                },
                service,
                characteristic,
            };
            run_watch(&target, config).await
        }
        Command::Decode { payload } => run_decode(&payload),
    }
}

async fn run_scan(args: &ScanArgs) -> Result<()> {
    let config = MonitorConfig {
        scan: args.settings()?,
        ..MonitorConfig::default()
    };
    let (platform, mut events) = BtleplugPlatform::new().await?;
    let mut monitor = TelemetryMonitor::new(platform, config);

    println!("{}", "Scanning...".bold());
    monitor.start_scan().map_err(|e| anyhow!("{}", e))?;

    while let Some(event) = events.recv().await {
        match monitor.handle_event(event) {
            Ok(Some(Update::ScanStopped)) => break,
            Ok(_) => {}
            Err(e @ MonitorError::Scan(_)) => return Err(anyhow!("{}", e)),
            Err(e) => display::error(&e),
        }
    }

    println!();
    println!("{}", "Peripherals".bold());
    display::peripherals(monitor.snapshot());
    Ok(())
}

async fn run_watch(target: &str, config: MonitorConfig) -> Result<()> {
    let (platform, mut events) = BtleplugPlatform::new().await?;
    let mut monitor = TelemetryMonitor::new(platform, config);

    println!("{}", "Telemetry Monitor".bold());
    println!("Target:         {}", target);
    println!("Service:        {}", monitor.config().service);
    println!("Characteristic: {}", monitor.config().characteristic);
    println!();

    println!("Scanning for \"{}\"...", target);
    monitor.start_scan().map_err(|e| anyhow!("{}", e))?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut failure = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match monitor.handle_event(event) {
                    Ok(Some(update)) => on_update(&mut monitor, target, update),
                    Ok(None) => {}
                    // The target has no usable telemetry characteristic; reconnecting would fail again
                    Err(e @ MonitorError::Subscribe(_)) => {
                        failure = Some(e);
                        break;
                    }
                    Err(e) => display::error(&e),
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    if !monitor.connection_state().is_disconnected() {
        if let Err(e) = monitor.disconnect() {
            display::error(&e);
        }
        wait_for_disconnect(&mut events).await;
    }
    display::summary(monitor.session());
    match failure {
        Some(e) => Err(anyhow!("{}", e)),
        None => Ok(()),
    }
}

fn on_update(monitor: &mut TelemetryMonitor<BtleplugPlatform>, target: &str, update: Update) {
    match update {
        Update::PeripheralsChanged => {
            if !monitor.connection_state().is_disconnected() {
                return;
            }
            let Some(id) = find_target(monitor.registry(), target) else {
                return;
            };
            println!("Found {}, connecting...", id);
            if let Err(e) = monitor.connect(&id) {
                display::error(&e);
            }
            display::connection(monitor.connection_state());
        }
        Update::ScanStopped => {
            if monitor.connection_state().is_disconnected() {
                println!("{}", format!("\"{}\" not found yet, scanning again", target).yellow());
                restart_scan(monitor);
            }
        }
        Update::Connected(_) => display::connection(monitor.connection_state()),
        Update::Disconnected(_) => {
            display::connection(monitor.connection_state());
            restart_scan(monitor);
        }
        Update::Subscribed(id) => {
            println!("{}", format!("Receiving telemetry from {}", id).green());
        }
        Update::Reading(reading) => display::reading(&reading, monitor.session()),
    }
}

fn restart_scan(monitor: &mut TelemetryMonitor<BtleplugPlatform>) {
    if let Err(e) = monitor.start_scan() {
        display::error(&e);
    }
}

/// Identity of the peripheral whose identity, or failing that name, is `target`
fn find_target(registry: &DiscoveryRegistry, target: &str) -> Option<PeripheralId> {
    registry
        .get(target)
        .or_else(|| registry.snapshot().iter().find(|r| r.name.as_str() == target))
        .map(|r| r.id.clone())
}

async fn wait_for_disconnect(events: &mut UnboundedReceiver<PlatformEvent>) {
    let confirmed = tokio::time::timeout(DISCONNECT_GRACE, async {
        while let Some(event) = events.recv().await {
            if matches!(event, PlatformEvent::DisconnectCompleted { .. }) {
                return;
            }
        }
    })
    .await;

    if confirmed.is_err() {
        log::warn!("disconnect not confirmed within {:?}", DISCONNECT_GRACE);
    }
}

fn run_decode(payload: &str) -> Result<()> {
    let reading = telemetry::decode(payload.as_bytes()).map_err(|e| anyhow!("{}", e))?;

    println!("{}", "Reading".bold());
    display::reading_fields(&reading);

    let canonical = telemetry::encode(&reading).map_err(|_| anyhow!("Reading does not fit in one payload"))?;
    println!("  Canonical:   {}", canonical);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ble_telemetry::DiscoveryEvent;

    fn registry(peripherals: &[(&str, &str)]) -> DiscoveryRegistry {
        let mut registry = DiscoveryRegistry::new();
        for (id, name) in peripherals {
            registry.observe(&DiscoveryEvent::new(id, Some(*name), 0).unwrap());
        }
        registry
    }

    #[test]
    fn test_find_target_by_name_or_identity() {
        let registry = registry(&[("AA:01", "Scooter"), ("AA:02", "Bike")]);

        assert_eq!(find_target(&registry, "Bike").unwrap().as_str(), "AA:02");
        assert_eq!(find_target(&registry, "AA:01").unwrap().as_str(), "AA:01");
        assert!(find_target(&registry, "Car").is_none());
    }

    #[test]
    fn test_find_target_prefers_identity_over_name() {
        let registry = registry(&[("AA:01", "AA:02"), ("AA:02", "Bike")]);

        assert_eq!(find_target(&registry, "AA:02").unwrap().as_str(), "AA:02");
    }

    #[test]
    fn test_scan_args_to_settings() {
        let args = ScanArgs {
            duration: 5,
            no_duplicates: true,
            filters: vec![telemetry_config::SERVICE_UUID],
        };
        let settings = args.settings().unwrap();

        assert_eq!(settings.duration_secs, 5);
        assert!(!settings.allow_duplicates);
        assert_eq!(settings.services.as_slice(), &[telemetry_config::SERVICE_UUID]);
    }

    #[test]
    fn test_too_many_filters_rejected() {
        let args = ScanArgs {
            duration: 5,
            no_duplicates: false,
            filters: vec![Uuid::nil(); scan::MAX_SERVICE_FILTERS + 1],
        };
        assert!(args.settings().is_err());
    }

    #[test]
    fn test_cli_parses_watch() {
        let args = Args::try_parse_from(["telemetry-monitor", "watch", "Scooter", "--duration", "3", "--persist"])
            .unwrap();
        match args.command {
            Command::Watch {
                target,
                scan,
                service,
                persist,
                ..
            } => {
                assert_eq!(target, "Scooter");
                assert_eq!(scan.duration, 3);
                assert_eq!(service, telemetry_config::SERVICE_UUID);
                assert!(persist);
            }
            _ => panic!("Expected Watch"),
        }
    }
}
