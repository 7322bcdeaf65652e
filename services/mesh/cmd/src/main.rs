//! Cluster mesh simulator.
//!
//! Spins up every node of a YAML topology as its own task, connects the
//! links, drives timers, injects the configured messages and link failures,
//! and prints where each node ended up.

use bytes::Bytes;
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod sim;

use config::SimConfig;
use logging::SimLogFormatter;
use sim::{NodeReport, Simulation};

/// Simulate cluster formation over an in-memory mesh
#[derive(Parser, Debug)]
#[command(name = "mesh-sim", version, about = "Simulate cluster formation over an in-memory mesh")]
struct Args {
    /// Topology file path
    #[arg(long, default_value = "topology.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// How long to run, e.g. 2s
    #[arg(long, default_value = "2s")]
    run_for: humantime::Duration,

    /// Timer tick interval, e.g. 100ms
    #[arg(long, default_value = "100ms")]
    tick_interval: humantime::Duration,

    /// Print the final node reports as JSON
    #[arg(long)]
    json: bool,
}

/// Something scheduled to happen during the run
enum Scheduled {
    Send { from: u16, to: u16, kind: config::SendKind, data: Bytes },
    Disconnect { a: u16, b: u16 },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("mesh_sim={}", args.log_level).parse()?)
        .add_directive(format!("mesh_cluster={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(SimLogFormatter::new("sim".to_string()))
        .init();

    info!("Starting mesh simulator v{}", env!("CARGO_PKG_VERSION"));

    let config = SimConfig::load_from_file(&args.config)?;
    let run_for = Duration::from(args.run_for);
    let tick_interval = Duration::from(args.tick_interval);

    let mut timeline: Vec<(Duration, Scheduled)> = config
        .sends
        .iter()
        .map(|send| {
            (
                Duration::from_millis(send.at_ms),
                Scheduled::Send {
                    from: send.from,
                    to: send.to,
                    kind: send.kind,
                    data: Bytes::from(send.data.clone().into_bytes()),
                },
            )
        })
        .chain(config.links.iter().filter_map(|link| {
            link.down_after_ms
                .map(|ms| (Duration::from_millis(ms), Scheduled::Disconnect { a: link.a, b: link.b }))
        }))
        .collect();
    timeline.sort_by_key(|(at, _)| *at);

    let simulation = Simulation::start(&config)?;
    simulation.connect_all();

    let started = Instant::now();
    let mut ticker = tokio::time::interval(tick_interval);
    let mut timeline = timeline.into_iter().peekable();

    loop {
        ticker.tick().await;
        let elapsed = started.elapsed();

        while let Some((_, event)) = timeline.next_if(|(at, _)| *at <= elapsed) {
            match event {
                Scheduled::Send { from, to, kind, data } => {
                    component_debug!("timeline", "Sending {:?} from node {} to node {}", kind, from, to);
                    simulation.send(from, to, kind, data);
                }
                Scheduled::Disconnect { a, b } => simulation.disconnect(a, b),
            }
        }

        simulation.tick();
        if elapsed >= run_for {
            break;
        }
    }

    let skipped = timeline.count();
    if skipped > 0 {
        component_warn!("timeline", "{} scheduled events fall after --run-for and were skipped", skipped);
    }

    let reports = simulation.reports().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_summary(&reports);
    }

    simulation.shutdown().await;
    info!("Simulation finished after {:?}", started.elapsed());
    Ok(())
}

fn print_summary(reports: &[NodeReport]) {
    for report in reports {
        let merged = report
            .links
            .iter()
            .filter(|link| link.phase == mesh_cluster::HandshakePhase::Merged)
            .count();
        component_info!(
            "report",
            "node {}: cluster {:#010x}, size {}, hops to sink {}, {}/{} links merged, {} messages, {} QoS reports",
            report.node_id,
            report.cluster.cluster_id(),
            report.cluster.cluster_size(),
            report.cluster.hops_to_sink(),
            merged,
            report.links.len(),
            report.delivered_messages,
            report.qos_reports
        );
    }
}
