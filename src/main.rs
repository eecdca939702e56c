//! Command-line front end for the near-field rig.
//!
//! Each invocation connects, performs one task and disconnects:
//! - `status`: connect and print the rig snapshot
//! - `home`: run the homing sequence
//! - `move`: home, then move to a position
//! - `jog`: home, then jog one axis for a while
//! - `sweep`: home, then visit every point of a serpentine grid
//!
//! # Usage
//!
//! ```bash
//! nearfield --dummy home
//! nearfield --endpoint COM4 move --to 10,5,-2
//! nearfield sweep --lateral 0,20,11 --transverse 0,10,6 --vertical -5,-5,1
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nearfield_rig::axis::Axis;
use nearfield_rig::config::{RigConfig, TransportKind, DEFAULT_CONFIG_PATH};
use nearfield_rig::controller::{MotionController, RigSnapshot, Status};
use nearfield_rig::sweep::{run_sweep, SpatialSweep, SweepRange};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "nearfield")]
#[command(about = "Near-field measurement rig motion control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Controller endpoint, overriding the configuration
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Use the simulated controller
    #[arg(long, global = true)]
    dummy: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print the rig state
    Status,

    /// Run the homing sequence
    Home {
        /// Time allowed for homing
        #[arg(long, default_value = "3m", value_parser = parse_duration)]
        timeout: Duration,
    },

    /// Home, then move to a position
    Move {
        /// Target in centimetres: lateral,transverse,vertical
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        to: Vec<f64>,

        /// Stage speed in cm/s
        #[arg(long)]
        speed: Option<f64>,

        /// Time allowed for the move
        #[arg(long, default_value = "2m", value_parser = parse_duration)]
        timeout: Duration,
    },

    /// Home, then jog one axis
    Jog {
        /// Axis to jog (lateral, transverse, vertical)
        #[arg(long)]
        axis: Axis,

        /// Jog forward instead of backward
        #[arg(long)]
        forward: bool,

        /// How long to jog before stopping
        #[arg(long, default_value = "2s", value_parser = parse_duration)]
        duration: Duration,
    },

    /// Home, then sweep a serpentine grid
    Sweep {
        /// Lateral range: start,stop,points
        #[arg(long, allow_hyphen_values = true)]
        lateral: SweepRange,

        /// Transverse range: start,stop,points
        #[arg(long, allow_hyphen_values = true)]
        transverse: SweepRange,

        /// Vertical range: start,stop,points
        #[arg(long, allow_hyphen_values = true)]
        vertical: SweepRange,

        /// Stage speed in cm/s
        #[arg(long)]
        speed: Option<f64>,

        /// Time allowed for each move
        #[arg(long, default_value = "2m", value_parser = parse_duration)]
        timeout: Duration,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.dummy {
        config.connection.transport = TransportKind::Dummy;
    }
    if let Some(endpoint) = &cli.endpoint {
        config.connection.endpoint = endpoint.clone();
    }
    config.validate()?;
    nearfield_rig::logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let rig = MotionController::from_config(&config)?;
    let outcome = run(&cli.command, &rig, &config);
    print_snapshot(&rig.snapshot());

    if rig.status().is_connected() {
        rig.disconnect()?;
        wait_for(&rig, Duration::from_secs(5), |s| {
            s.status == Status::Disconnected
        });
    }
    rig.shutdown();
    outcome
}

fn run(command: &Commands, rig: &MotionController, config: &RigConfig) -> Result<()> {
    connect(rig, &config.connection.endpoint)?;

    match command {
        Commands::Status => {}
        Commands::Home { timeout } => home(rig, *timeout)?,
        Commands::Move { to, speed, timeout } => {
            let [x, y, z] = to.as_slice() else {
                bail!("--to needs exactly three coordinates");
            };
            home(rig, config.timing.homing_timeout)?;
            if let Some(speed) = speed {
                rig.set_speed(*speed)?;
            }
            if !rig.move_absolute_blocking([*x, *y, *z], *timeout) {
                bail!("move to [{x}, {y}, {z}] did not complete");
            }
        }
        Commands::Jog {
            axis,
            forward,
            duration,
        } => {
            home(rig, config.timing.homing_timeout)?;
            rig.jog(*axis, *forward)?;
            std::thread::sleep(*duration);
            rig.stop()?;
            wait_for(rig, Duration::from_secs(5), |s| !s.status.is_moving());
        }
        Commands::Sweep {
            lateral,
            transverse,
            vertical,
            speed,
            timeout,
        } => {
            let sweep = SpatialSweep::new([*lateral, *transverse, *vertical])?;
            home(rig, config.timing.homing_timeout)?;
            if let Some(speed) = speed {
                rig.set_speed(*speed)?;
            }
            let visited = run_sweep(rig, &sweep, *timeout, |index, target| {
                println!(
                    "{index:>5}  {:>8.3} {:>8.3} {:>8.3}",
                    target[0], target[1], target[2]
                );
                Ok(())
            })?;
            info!(visited, "Sweep done");
        }
    }
    Ok(())
}

fn connect(rig: &MotionController, endpoint: &str) -> Result<()> {
    rig.connect(endpoint)?;
    let settled = wait_for(rig, Duration::from_secs(30), |s| {
        s.status.is_connected() || s.connect_error.is_some()
    });
    let snapshot = rig.snapshot();
    if let Some(reason) = snapshot.connect_error {
        bail!("connect to {endpoint} failed: {reason}");
    }
    if !settled {
        bail!("connect to {endpoint} timed out");
    }
    Ok(())
}

fn home(rig: &MotionController, timeout: Duration) -> Result<()> {
    rig.home()?;
    let settled = wait_for(rig, timeout, |s| {
        s.position_known || s.status == Status::Disconnected
    });
    if !settled || rig.status() != Status::Stopped {
        bail!("homing failed: {:?}", rig.errors());
    }
    Ok(())
}

fn wait_for(
    rig: &MotionController,
    timeout: Duration,
    done: impl Fn(&RigSnapshot) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(&rig.snapshot()) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn print_snapshot(snapshot: &RigSnapshot) {
    println!("status:   {}", snapshot.status);
    if let Some(endpoint) = &snapshot.endpoint {
        println!("endpoint: {endpoint}");
    }
    println!("speed:    {} cm/s", snapshot.speed_cm_s);
    for axis in Axis::ALL {
        let t = snapshot.limit_state(axis);
        let counts = snapshot
            .position_counts()
            .map_or_else(|| "unknown".to_string(), |p| p[axis.index()].to_string());
        println!("{axis:>10}: {counts:>10} counts  limit {t:?}");
    }
    for (kind, message) in snapshot.errors.iter() {
        println!("error:    {kind}: {message}");
    }
}
