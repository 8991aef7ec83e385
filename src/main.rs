use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cronmesh::agent::Agent;
use cronmesh::config::Conf;
use cronmesh::executor::ShellJob;
use cronmesh::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "cronmesh")]
#[command(about = "A distributed, fault-tolerant cron scheduler")]
struct Args {
    /// Path to the JSON config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Cluster peers to join (comma-separated, format: "host:port")
    /// Example: "10.0.0.2:7946,10.0.0.3:7946"
    #[arg(long, default_value = "")]
    nodes: String,

    /// Shell job to register, repeatable (format: "name=command")
    #[arg(long = "job")]
    jobs: Vec<String>,
}

fn parse_nodes(nodes: &str) -> Vec<String> {
    nodes
        .split(',')
        .map(|node| node.trim().to_string())
        .filter(|node| !node.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let conf = match &args.config {
        Some(path) => Conf::load(path)?,
        None => Conf::default(),
    };

    tracing::info!(
        node_name = %conf.gossip.node_name,
        http_addr = %conf.base.http_addr,
        bind_port = conf.gossip.bind_port,
        "starting cronmesh agent"
    );

    let cancel = install_shutdown_handler();
    let (agent, rx) = Agent::new(conf, cancel).await?;

    for job in &args.jobs {
        let Some((name, command)) = job.split_once('=') else {
            tracing::warn!(job = %job, "invalid job flag, expected name=command");
            continue;
        };
        agent.register_job(Arc::new(ShellJob::new(name, command)))?;
    }

    let seeds = parse_nodes(&args.nodes);
    if !seeds.is_empty() {
        let joined = agent.join(&seeds).await?;
        tracing::info!(joined, "joined cluster");
    }

    agent.run(rx).await?;
    Ok(())
}
