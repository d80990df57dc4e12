//! amBX command-line tool
//!
//! Lists Philips amBX gaming lights and sets their colors.

use ambx_common::{RusbBackend, setup_logging};
use ambx_driver::{
    AmbxConfig, AmbxController, ClaimPolicy, ControllerInfo, ControllerRegistry, Discovery,
    SessionSettings,
};
use ambx_protocol::{Rgb, Zone};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ambx")]
#[command(author, version, about = "Control Philips amBX gaming lights")]
#[command(long_about = "
Userspace driver for the Philips amBX gaming lights (USB 0471:083f).

EXAMPLES:
    # List connected devices
    ambx list

    # Paint the wallwasher center orange and leave it on
    ambx set wall-center ff8000 --keep

    # Set several lights in one go
    ambx zones left=ff0000 right=0000ff wall-center=00ff00 --keep

    # Switch everything off
    ambx off

CONFIGURATION:
    The configuration file is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/ambx/ambx.toml
    3. /etc/ambx/ambx.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Override the configured interface claim policy
    #[arg(long, value_enum, global = true)]
    claim_policy: Option<ClaimPolicy>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List amBX devices
    List {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// Only enumerate, do not open the devices
        #[arg(long)]
        probe_only: bool,
    },

    /// Set one zone (left, right, wall-left, wall-center, wall-right, all)
    Set {
        zone: Zone,
        /// Color as rrggbb, #rrggbb or 0xrrggbb
        color: Rgb,
        /// Leave the lights on when the tool exits
        #[arg(long)]
        keep: bool,
    },

    /// Set all five lights to one color
    All {
        color: Rgb,
        #[arg(long)]
        keep: bool,
    },

    /// Set several zones, e.g. left=ff0000 wall-center=00ff00
    Zones {
        #[arg(required = true, value_name = "ZONE=COLOR", value_parser = parse_assignment)]
        assignments: Vec<(Zone, Rgb)>,
        #[arg(long)]
        keep: bool,
    },

    /// Switch all lights off
    Off,
}

fn parse_assignment(s: &str) -> std::result::Result<(Zone, Rgb), String> {
    let (zone, color) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ZONE=COLOR, got '{}'", s))?;
    let zone = zone.parse::<Zone>().map_err(|e| e.to_string())?;
    let color = color.parse::<Rgb>().map_err(|e| e.to_string())?;
    Ok((zone, color))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = AmbxConfig::default();
        let path = AmbxConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        AmbxConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        AmbxConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ambx v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = config.session.clone();
    if let Some(policy) = args.claim_policy {
        settings.claim_policy = policy;
    }

    match args.command.unwrap_or(Command::List {
        json: false,
        probe_only: false,
    }) {
        Command::List { json, probe_only } => list_devices(settings, json, probe_only),
        Command::Set { zone, color, keep } => {
            apply_to_all(settings, keep, |c| c.set_zone_color(zone, color))
        }
        Command::All { color, keep } => apply_to_all(settings, keep, |c| c.set_all_zones(color)),
        Command::Zones { assignments, keep } => {
            let (zones, colors): (Vec<Zone>, Vec<Rgb>) = assignments.into_iter().unzip();
            apply_to_all(settings, keep, |c| c.set_many_zones(&zones, &colors))
        }
        // Already dark, so skip the teardown blanking
        Command::Off => apply_to_all(settings, true, |c| c.set_all_zones(Rgb::OFF)),
    }
}

/// List devices and exit
fn list_devices(mut settings: SessionSettings, json: bool, probe_only: bool) -> Result<()> {
    // Listing must not change what the lights show
    settings.blank_on_open = false;
    settings.blank_on_close = false;

    let discovery = Discovery::new(RusbBackend, settings);

    if probe_only {
        let identities = discovery
            .find_devices()
            .context("Failed to enumerate USB devices")?;

        if json {
            println!("{}", serde_json::to_string_pretty(&identities)?);
        } else if identities.is_empty() {
            println!("No amBX devices found.");
        } else {
            println!("Found {} amBX device(s):\n", identities.len());
            for identity in identities {
                println!("  {}", identity.location());
            }
        }
        return Ok(());
    }

    let mut registry = ControllerRegistry::new();
    let report = discovery
        .scan(&mut registry)
        .context("Failed to scan for amBX devices")?;

    let infos: Vec<ControllerInfo> = registry.iter().map(AmbxController::info).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    if report.matched == 0 {
        println!("No amBX devices found.");
        return Ok(());
    }

    println!("Found {} amBX device(s):\n", report.matched);
    for info in &infos {
        println!("  {} - {}", info.name, info.description);
        println!("      {}", info.location);
        if !info.serial.is_empty() {
            println!("      Serial: {}", info.serial);
        }
        for zone in &info.zones {
            let leds: Vec<&str> = zone.leds.iter().map(|led| led.name).collect();
            println!("      {}: {}", zone.name, leds.join(", "));
        }
        println!();
    }
    for (identity, e) in &report.failures {
        println!("  {} - unavailable: {}", identity.location(), e);
        if let Some(hint) = e.remediation() {
            println!("      {}", hint);
        }
        println!();
    }

    Ok(())
}

/// Open every amBX and run `op` on each one
fn apply_to_all<F>(settings: SessionSettings, keep: bool, mut op: F) -> Result<()>
where
    F: FnMut(&mut AmbxController<RusbBackend>) -> ambx_driver::Result<()>,
{
    let discovery = Discovery::new(RusbBackend, settings);
    let mut registry = ControllerRegistry::new();
    let report = discovery
        .scan(&mut registry)
        .context("Failed to scan for amBX devices")?;

    if registry.is_empty() {
        if report.matched == 0 {
            bail!("No amBX devices found");
        }
        return Err(anyhow!(
            "Found {} amBX device(s) but none could be initialized",
            report.matched
        ));
    }

    let mut failed = 0;
    for controller in registry.iter_mut() {
        if keep {
            controller.session_mut().set_blank_on_close(false);
        }
        if let Err(e) = op(controller) {
            error!("{}: {}", controller.name(), e);
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} device(s) failed", failed, registry.len());
    }
    Ok(())
}
