use anyhow::Result;
use clap::Parser;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use swarmtimesync::clock::ClockClass;
use swarmtimesync::config::{SimConfig, TopologyKind};
use swarmtimesync::sim::Simulator;
use swarmtimesync::topology::ConsensusAlgorithm;

#[derive(Parser, Debug)]
#[command(author, version, about = "Time sync simulator for drone swarms", long_about = None)]
struct Args {
    /// Fleet size including the initial master.
    #[arg(short, long, default_value_t = 10)]
    nodes: usize,

    /// master-slave | peer-to-peer | hierarchical | mesh
    #[arg(short, long, default_value = "master-slave")]
    topology: TopologyKind,

    /// weighted-average | kuramoto (peer-to-peer only)
    #[arg(long, default_value = "weighted-average")]
    algorithm: ConsensusAlgorithm,

    /// rubidium | ocxo | tcxo | quartz
    #[arg(long, default_value = "rubidium")]
    master_clock: ClockClass,

    #[arg(long, default_value = "tcxo")]
    slave_clock: ClockClass,

    /// Simulated seconds to run; 0 runs until Ctrl+C.
    #[arg(short, long, default_value_t = 100.0)]
    duration: f64,

    /// Simulated seconds per sync cycle.
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-exchange packet loss probability.
    #[arg(long, default_value_t = 0.02)]
    loss: f64,

    /// Radio range in meters.
    #[arg(long, default_value_t = 500.0)]
    range: f64,

    /// Enable random node failures and master self-demotion.
    #[arg(long, default_value_t = false)]
    failures: bool,

    /// Pace the loop at one sync interval of wall time per cycle.
    #[arg(long, default_value_t = false)]
    realtime: bool,
}

fn config_from(args: &Args) -> SimConfig {
    let mut cfg = SimConfig::default();
    cfg.ensemble.node_count = args.nodes;
    cfg.ensemble.topology = args.topology;
    cfg.ensemble.consensus_algorithm = args.algorithm;
    cfg.ensemble.master_clock = args.master_clock;
    cfg.ensemble.slave_clock = args.slave_clock;
    cfg.ensemble.sync_interval_s = args.interval;
    cfg.ensemble.radio_range_m = args.range;
    cfg.ensemble.seed = args.seed;
    cfg.link.loss_probability = args.loss;
    cfg.failure.enabled = args.failures;
    cfg
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let cfg = config_from(&args);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut sim = Simulator::new();
    sim.start(cfg)?;

    let mut last_report_s = 0.0;
    while running.load(Ordering::SeqCst) {
        let metrics = sim.tick()?;

        if metrics.time_s - last_report_s >= 10.0 {
            info!(
                "t={:.0}s master={:?} avg_offset={:.1}ns max={:.1}ns locked={}/{} coverage={:.0}% r={:.3}",
                metrics.time_s,
                metrics.master_id,
                metrics.average_offset_ns,
                metrics.max_offset_ns,
                metrics.dpll_locked_count,
                metrics.active_count.saturating_sub(metrics.master_count),
                metrics.sync_coverage * 100.0,
                metrics.order_parameter,
            );
            last_report_s = metrics.time_s;
        }

        if args.duration > 0.0 && metrics.time_s >= args.duration {
            break;
        }
        if args.realtime {
            thread::sleep(Duration::from_secs_f64(args.interval));
        }
    }

    let status = sim.status();
    info!(
        "run complete: t={:.0}s avg_offset={:.1}ns resilience={:.2} alerts={}",
        status.time_s,
        status.metrics.average_offset_ns,
        status.metrics.failure_resilience,
        status.alert_count
    );
    for alert in sim.alerts().iter().rev().take(5).rev() {
        info!(
            "  alert t={:.1}s {:?} subject={:?} value={:.2}",
            alert.time_s, alert.kind, alert.subject, alert.value
        );
    }
    sim.stop();
    Ok(())
}
