use cluster_events::cluster::config::ClusterConfig;
use cluster_events::cluster::engine::{ClusterEngine, MembershipEvents};
use cluster_events::cluster::listeners::{ClusterListener, Delivery, ListenerResult};
use cluster_events::cluster::types::{ClusterEvent, NodeId};
use std::sync::Arc;
use std::time::Duration;

/// Logs every event it receives.
struct LoggingListener {
    label: &'static str,
    delivery: Delivery,
}

impl LoggingListener {
    fn log(&self, event: &ClusterEvent) -> ListenerResult {
        let thread = std::thread::current();
        tracing::info!(
            "[{}] {} (on {})",
            self.label,
            event,
            thread.name().unwrap_or("<unnamed>")
        );
        Ok(())
    }
}

impl ClusterListener for LoggingListener {
    fn node_joined(&self, event: &ClusterEvent) -> ListenerResult {
        self.log(event)
    }

    fn node_left(&self, event: &ClusterEvent) -> ListenerResult {
        self.log(event)
    }

    fn operations_enabled(&self, event: &ClusterEvent) -> ListenerResult {
        self.log(event)
    }

    fn operations_disabled(&self, event: &ClusterEvent) -> ListenerResult {
        self.log(event)
    }

    fn node_rejoined(&self, event: &ClusterEvent) -> ListenerResult {
        self.log(event)
    }

    fn node_error(&self, event: &ClusterEvent) -> ListenerResult {
        self.log(event)
    }

    fn delivery(&self, _event: &ClusterEvent) -> Delivery {
        self.delivery
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} --local <id> [--peer <id>]...", args[0]);
        eprintln!("Example: {} --local 1", args[0]);
        eprintln!("Example: {} --local 1 --peer 2 --peer 3", args[0]);

        std::process::exit(1);
    }

    let mut local: Option<NodeId> = None;
    let mut peers: Vec<NodeId> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--local" if i + 1 < args.len() => {
                local = Some(NodeId(args[i + 1].parse()?));
                i += 2;
            }
            "--peer" if i + 1 < args.len() => {
                peers.push(NodeId(args[i + 1].parse()?));
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let Some(local) = local else {
        anyhow::bail!("--local is required");
    };

    let config = ClusterConfig::from_env()?;
    tracing::info!("Starting cluster engine with {:?}", config);

    let engine = ClusterEngine::new(config);
    engine.init(&tokio::runtime::Handle::current())?;

    engine.add_listener(Arc::new(LoggingListener {
        label: "ordered",
        delivery: Delivery::Ordered,
    }));
    engine.add_listener(Arc::new(LoggingListener {
        label: "out-of-band",
        delivery: Delivery::OutOfBand,
    }));

    // Membership calls may block (leave waits for a pending disablement),
    // so they run off the async workers.
    let membership: Arc<dyn MembershipEvents> = engine.clone();
    tokio::task::spawn_blocking(move || {
        let mut members = vec![local];
        members.extend(peers.iter().copied());
        membership.this_node_joined(local, &members);

        let visitor = NodeId(members.iter().map(|id| id.0).max().unwrap_or(0) + 1);
        membership.node_joined(visitor);
        membership.node_left(visitor);

        membership.operations_disabled();
        membership.operations_enabled();
        membership.this_node_left();
    })
    .await?;

    let topology: Vec<String> = engine.topology().iter().map(|n| n.name.clone()).collect();
    tracing::info!("Topology after leaving: {:?}", topology);

    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.shutdown();

    Ok(())
}
