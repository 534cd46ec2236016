//! Headless host: starts the startup profiles and logs where each mount points

use anyhow::Context;
use clap::Parser;
use scopelink::coordinates::{radians_to_hours, rect_to_spherical};
use scopelink::{ControlConfig, ProfileStore, TelescopeControl};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect to configured telescopes and log their positions")]
struct Args {
    /// Profile file
    #[arg(short, long, default_value = "telescopes.json")]
    profiles: PathBuf,

    /// Optional tunables file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Update rate in Hz
    #[arg(long, default_value_t = 20.0)]
    rate: f64,

    /// Seconds between position log lines
    #[arg(long, default_value_t = 2.0)]
    report_every: f64,

    /// Start these profiles in addition to the startup ones
    #[arg(short, long)]
    start: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ControlConfig::from_json_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ControlConfig::default(),
    };

    let mut control = TelescopeControl::new(config)
        .context("starting I/O runtime")?
        .with_store(ProfileStore::new(&args.profiles));
    let loaded = control.load_profiles().context("loading profiles")?;
    if loaded == 0 {
        anyhow::bail!("no profiles in {}", args.profiles.display());
    }

    let mut started = control.start_all_at_startup();
    for name in &args.start {
        if control.start_connection(name) {
            started.push(name.clone());
        }
    }
    if started.is_empty() {
        anyhow::bail!("nothing to monitor: no profile connects at startup and none given with --start");
    }
    tracing::info!("Monitoring {}", started.join(", "));

    let period = Duration::from_secs_f64(1.0 / args.rate.clamp(0.1, 1000.0));
    let report_every = Duration::from_secs_f64(args.report_every.max(0.1));
    let mut last_tick = Instant::now();
    let mut last_report = Instant::now();
    loop {
        std::thread::sleep(period);
        let elapsed = last_tick.elapsed();
        last_tick = Instant::now();
        control.tick(elapsed.as_micros() as i64);

        if last_report.elapsed() >= report_every {
            last_report = Instant::now();
            let now = control.now_micros();
            for id in control.list_connected_ids() {
                if !control.has_known_position(&id) {
                    tracing::info!("{}: position unknown (connected: {})", id, control.is_connected(&id));
                    continue;
                }
                let (ra, dec) = rect_to_spherical(&control.get_equatorial_position(&id, now));
                tracing::info!(
                    "{}: RA {:.4}h Dec {:+.3}°",
                    id,
                    radians_to_hours(ra),
                    dec.to_degrees()
                );
            }
        }
    }
}
