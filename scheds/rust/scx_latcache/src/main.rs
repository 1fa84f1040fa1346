// SPDX-License-Identifier: GPL-2.0
//
// scx_latcache: Cache- and core-type-aware scheduling policy
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use log::warn;
use scx_stats::prelude::*;

use scx_latcache::config::Config;
use scx_latcache::config::EcoreOffload;
use scx_latcache::config::TunablesCell;
use scx_latcache::events::EventHandler;
use scx_latcache::events::EventStream;
use scx_latcache::hints::Hints;
use scx_latcache::profiles::ProfileManager;
use scx_latcache::sim::Scenario;
use scx_latcache::sim::SimHost;
use scx_latcache::sim::Simulator;
use scx_latcache::stats;
use scx_latcache::stats::Metrics;
use scx_latcache::topology::Preset;
use scx_latcache::Engine;
use scx_latcache::SCHEDULER_NAME;

/// Simulated time advanced per loop iteration, paced to wall time.
const STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, clap::Parser)]
#[command(
    name = "scx_latcache",
    version,
    disable_version_flag = true,
    about = "Cache- and core-type-aware scheduling policy, driven by an in-process simulator."
)]
struct Opts {
    /// JSON configuration file. Command line options override its values.
    #[clap(short = 'c', long, env = "SCX_LATCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Topology to simulate: 7900x3d, 7950x3d, 9900x3d, 9950x3d, 7800x3d,
    /// 9800x3d, 12600k, 13900k, 14900k or generic.
    #[clap(short = 't', long, default_value = "7950x3d")]
    preset: String,

    /// Maximum scheduling slice duration in microseconds.
    #[clap(short = 's', long)]
    slice_us: Option<u64>,

    /// Tasks whose average burst is below this are interactive, in microseconds.
    #[clap(short = 'b', long)]
    burst_us: Option<u64>,

    /// Do not favour tasks classified as gaming.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_gaming_mode: bool,

    /// Place tasks on the high-frequency domain first (productivity workloads).
    #[clap(short = 'w', long, action = clap::ArgAction::SetTrue)]
    work_mode: bool,

    /// E-core offload policy on hybrid parts: disabled, conservative or aggressive.
    #[clap(long)]
    ecore_offload: Option<String>,

    /// Treat the non-cache domain as the higher-clocking one.
    #[clap(short = 'a', long, action = clap::ArgAction::SetTrue)]
    asymmetric_boost: bool,

    /// Do not search for fully idle physical cores first.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_smt_preference: bool,

    /// Directory of per-game JSON profiles.
    #[clap(long, env = "SCX_LATCACHE_PROFILES")]
    profiles_dir: Option<PathBuf>,

    /// Number of compiler jobs in the simulated workload.
    #[clap(long, default_value = "8")]
    batch_jobs: usize,

    /// Seed for the simulated workload.
    #[clap(long, default_value = "1")]
    seed: u64,

    /// Stop after this many seconds. 0 runs until interrupted.
    #[clap(short = 'd', long, default_value = "0")]
    duration_s: f64,

    /// Print statistics at the specified interval, in seconds.
    #[clap(long)]
    stats: Option<f64>,

    /// Print the engine dump on exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump: bool,

    /// Enable verbose output, including every scheduling event.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,
}

impl Opts {
    fn build_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        let t = &mut config.tunables;
        if let Some(us) = self.slice_us {
            t.slice_ns = us * 1000;
        }
        if let Some(us) = self.burst_us {
            t.burst_threshold_ns = us * 1000;
        }
        if self.no_gaming_mode {
            t.gaming_mode = false;
        }
        if self.work_mode {
            t.work_mode = true;
        }

        let e = &mut config.engine;
        if let Some(mode) = &self.ecore_offload {
            e.ecore_offload = mode.parse::<EcoreOffload>()?;
        }
        if self.asymmetric_boost {
            e.asymmetric_boost = true;
        }
        if self.no_smt_preference {
            e.prefer_idle_smt = false;
        }
        if self.profiles_dir.is_some() {
            config.profiles_dir = self.profiles_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn preset(&self, asymmetric_boost: bool) -> Result<Preset> {
        let preset: Preset = self
            .preset
            .parse()
            .with_context(|| format!("valid presets: {}", Preset::NAMES.join(", ")))?;
        Ok(match preset {
            Preset::DualCcdX3d { cores_per_ccd, smt, asymmetric_boost: boost } => Preset::DualCcdX3d {
                cores_per_ccd,
                smt,
                asymmetric_boost: boost || asymmetric_boost,
            },
            other => other,
        })
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let loglevel = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    // Falls back to UTC when the local offset cannot be determined.
    let lcfg = match lcfg.set_time_offset_to_local() {
        Ok(b) | Err(b) => b,
    };
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

/// Drain the event stream until shutdown, then once more.
fn consume_events(events: Arc<EventStream>, verbose: bool, shutdown: Arc<AtomicBool>) -> EventHandler {
    let handler = EventHandler::new(verbose);
    while !shutdown.load(Ordering::Relaxed) {
        if events.drain(|ev| handler.handle(&ev)) == 0 {
            thread::sleep(Duration::from_millis(20));
        }
    }
    events.drain(|ev| handler.handle(&ev));
    handler
}

fn run(opts: &Opts, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut config = opts.build_config()?;
    let topo = Arc::new(opts.preset(config.engine.asymmetric_boost)?.build()?);
    if topo.freq_domain().is_some() {
        config.engine.asymmetric_boost = true;
    }
    info!("Simulating {} with {} compiler jobs", opts.preset, opts.batch_jobs);

    let host = Arc::new(SimHost::new(&topo));
    let engine = Arc::new(Engine::init(
        host,
        topo,
        config.engine.clone(),
        Arc::new(TunablesCell::new(config.tunables)),
        Arc::new(Hints::default()),
    )?);

    let mut sim = Simulator::new(engine.clone(), &Scenario::gaming_desktop(opts.batch_jobs), opts.seed);
    if let Some(dir) = &config.profiles_dir {
        sim = sim.with_profiles(ProfileManager::new(dir)?);
    }

    let stats_server = match StatsServer::new(stats::server_data()).launch() {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to launch stats server: {:#}", e);
            None
        }
    };
    let channels = stats_server.as_ref().map(|s| s.channels());

    let consumer_stop = Arc::new(AtomicBool::new(false));
    let consumer = {
        let events = engine.events().clone();
        let stop = consumer_stop.clone();
        let verbose = opts.verbose;
        thread::spawn(move || consume_events(events, verbose, stop))
    };

    let started = Instant::now();
    let deadline = (opts.duration_s > 0.0).then(|| Duration::from_secs_f64(opts.duration_s));
    let stats_interval = opts.stats.map(Duration::from_secs_f64);
    let mut last_stats = Instant::now();
    let mut prev = Metrics::from_engine(&engine);

    while !shutdown.load(Ordering::Relaxed) && !engine.exited() {
        sim.run_for(STEP.as_nanos() as u64);

        if let Some((stats_response_tx, stats_request_rx)) = &channels {
            while stats_request_rx.try_recv().is_ok() {
                stats_response_tx.send(Metrics::from_engine(&engine))?;
            }
        }

        if let Some(intv) = stats_interval {
            if last_stats.elapsed() >= intv {
                let cur = Metrics::from_engine(&engine);
                cur.delta(&prev).format(&mut std::io::stdout())?;
                prev = cur;
                last_stats = Instant::now();
            }
        }

        if deadline.is_some_and(|d| started.elapsed() >= d) {
            engine.exit("duration elapsed");
            break;
        }
        thread::sleep(STEP);
    }
    engine.exit("shutdown requested");

    consumer_stop.store(true, Ordering::Relaxed);
    match consumer.join() {
        Ok(handler) => info!("Events: {}", handler.counters.summary()),
        Err(_) => warn!("event consumer thread panicked"),
    }

    info!(
        "{} exited ({}) after {} simulated events",
        SCHEDULER_NAME,
        engine.exit_reason().unwrap_or("unknown"),
        sim.events_processed()
    );
    if opts.dump {
        print!("{}", engine.dump());
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", SCHEDULER_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    init_logging(opts.verbose)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    run(&opts, shutdown)
}
