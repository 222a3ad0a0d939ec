//! Terminal rendering of monitor state.

use std::fmt::Display;

use ble_telemetry::{ConnectionState, PeripheralRecord, TelemetryReading, TelemetrySession};
use colored::Colorize;

/// Print the discovered peripheral list.
pub fn peripherals(records: &[PeripheralRecord]) {
    if records.is_empty() {
        println!("  {}", "No named peripherals found".yellow());
        return;
    }

    for (index, record) in records.iter().enumerate() {
        println!(
            "  {:>2}. {}  {}",
            index + 1,
            record.name.as_str().bold(),
            record.id.as_str().green()
        );
    }
}

/// Print a connection state change.
pub fn connection(state: &ConnectionState) {
    let label = match state {
        ConnectionState::Connected(_) => state.label().green().bold(),
        ConnectionState::Disconnected => state.label().red().bold(),
        _ => state.label().yellow(),
    };
    match state.peripheral() {
        Some(id) => println!("{} {}", label, id),
        None => println!("{}", label),
    }
}

/// Print one reading with the session counters.
pub fn reading(reading: &TelemetryReading, session: &TelemetrySession) {
    println!(
        "  speed {:>4}  odometer {:>10}  temp {:>4}  battery {:>3}  {}",
        reading.speed,
        reading.odometer,
        reading.temperature,
        reading.battery_status,
        format!("[#{} ok, {} bad]", session.readings, session.failures).dimmed()
    );
}

/// Print the fields of a decoded payload.
pub fn reading_fields(reading: &TelemetryReading) {
    println!("  Speed:       {}", reading.speed);
    println!("  Odometer:    {}", reading.odometer);
    println!("  Temperature: {}", reading.temperature);
    println!("  Battery:     {}", reading.battery_status);
}

/// Print session totals when the monitor exits.
pub fn summary(session: &TelemetrySession) {
    println!();
    println!("{}", "Session".bold());
    match &session.reading {
        Some(last) => println!("  Last reading: {}", last),
        None => println!("  Last reading: {}", "none".yellow()),
    }
    println!("  Decoded:      {}", session.readings.to_string().green());
    if session.failures > 0 {
        println!("  Rejected:     {}", session.failures.to_string().red());
    } else {
        println!("  Rejected:     0");
    }
}

/// Print a recoverable error.
pub fn error(e: &impl Display) {
    eprintln!("  {}", e.to_string().red());
}
