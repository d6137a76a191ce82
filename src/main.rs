use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use murmur::cli;
use murmur::member::{Member, MemberStatus};
use murmur::membership::suspicion::suspicion_timeout;
use murmur::settings::{APP_NAME, APP_VERSION};
use murmur::sim::{LocalNetwork, SimNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let args = cli::Cli::parse();
    if args.nodes == 0 {
        anyhow::bail!("at least one member is required");
    }
    let settle = Duration::from_secs(args.run_seconds);
    let settings = args.clone().into_settings();
    settings.validate()?;
    info!("Starting {} {} with {} members", APP_NAME, APP_VERSION, args.nodes);

    let network = LocalNetwork::new();
    let first_address = args.member_address(0)?;
    let mut nodes: Vec<SimNode> = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        let address = args.member_address(index)?;
        let mut node_settings = settings.clone();
        if index > 0 {
            node_settings.seed_members.insert(0, first_address);
        }
        let metadata = Bytes::from(format!("member-{}", index));
        let node = network.spawn_node(Member::new(address), metadata, node_settings)?;

        let mut events = node.protocol.listen();
        let member = node.member().clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                info!("[{}] {}", member, event);
            }
        });
        nodes.push(node);
    }

    // Join one after another, then announce so everybody hears about everybody
    for node in &nodes {
        node.protocol.start().await?;
    }
    for node in &nodes {
        if let Err(e) = node.protocol.update_incarnation().await {
            warn!("[{}] Failed to announce: {}", node.member(), e);
        }
    }
    tokio::time::sleep(settle).await;
    report(&nodes)?;

    if nodes.len() > 1 {
        let crashed = nodes[nodes.len() - 1].member().clone();
        info!("Disconnecting {}", crashed);
        network.disconnect(crashed.address());
        for node in &nodes[..nodes.len() - 1] {
            node.failure_detector
                .emit(crashed.clone(), MemberStatus::Suspect)
                .await;
        }

        let timeout = suspicion_timeout(
            settings.suspicion_mult,
            nodes.len(),
            settings.ping_interval(),
        );
        info!("Waiting {}ms for suspicion to expire", timeout.as_millis());
        tokio::time::sleep(timeout + settle).await;
        report(&nodes[..nodes.len() - 1])?;
    }

    for node in &nodes {
        node.protocol.stop().await;
    }
    info!("All members stopped");
    Ok(())
}

fn report(nodes: &[SimNode]) -> anyhow::Result<()> {
    for node in nodes {
        let metrics = node.protocol.metrics();
        info!(
            "[{}] sees {} member(s): {}",
            node.member(),
            node.protocol.members().len(),
            serde_json::to_string(&metrics)?
        );
    }
    Ok(())
}
