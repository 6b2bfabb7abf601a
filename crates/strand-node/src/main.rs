use anyhow::Context;
use clap::Parser;
use models::{NodeRole, Snode};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod logging;
mod node;
mod server;

#[derive(Debug, clap::ValueEnum, Clone, Copy, PartialEq, Eq)]
enum Role {
    Proxy,
    Target,
}

#[derive(Debug, Parser)]
#[command(name = "strand-node", about = "Strand storage cluster node")]
struct Args {
    /// Serving endpoint, e.g. http://0.0.0.0:8080
    #[arg(long, env = "STRAND_ENDPOINT")]
    endpoint: url::Url,

    /// Stable node identity; survives restarts.
    #[arg(long, env = "MY_NODE")]
    node_id: String,

    #[arg(long, value_enum)]
    role: Role,

    /// Storage roots (targets only); repeatable.
    #[arg(long = "mountpath")]
    mountpaths: Vec<std::path::PathBuf>,

    /// Bootstrap this node as the cluster's primary gateway.
    #[arg(long, env = "STRAND_IS_PRIMARY", default_value_t = false)]
    primary: bool,

    /// Primary endpoint to join (non-primary nodes).
    #[arg(long)]
    join: Option<url::Url>,

    /// Permit mountpaths sharing one filesystem (dev/test rigs).
    #[arg(long, default_value_t = false)]
    test_fsid_override: bool,

    #[command(flatten)]
    log: logging::LogArgs,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(&args.log);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?
        .block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let role = match args.role {
        Role::Proxy => NodeRole::Proxy,
        Role::Target => NodeRole::Target,
    };
    if role == NodeRole::Target && args.mountpaths.is_empty() {
        anyhow::bail!("a target requires at least one --mountpath");
    }

    // Volume first: replicated metadata persists through it.
    let mpi = Arc::new(volume::Mpi::new(args.test_fsid_override));
    for path in &args.mountpaths {
        let mi = mpi
            .attach(path, "")
            .with_context(|| format!("attaching mountpath {}", path.display()))?;
        tracing::info!(mpath = %mi.path.display(), fsid = mi.fsid, "mountpath attached");
    }
    let vmd_check = volume::Vmd::load(&mpi.snapshot());
    if let Some(vmd) = &vmd_check {
        for lost in vmd.lost(&mpi.snapshot()) {
            tracing::warn!(mpath = %lost.path.display(), "mountpath recorded in VMD is missing");
        }
    }

    let self_snode = Snode::new(args.node_id.clone(), role, args.endpoint.clone());
    let smap = if args.primary {
        models::Smap::new(uuid::Uuid::new_v4().to_string(), self_snode.clone())
    } else {
        models::Smap::default()
    };
    let persist_mpi = if args.mountpaths.is_empty() {
        None
    } else {
        Some(mpi.clone())
    };
    let owners = Arc::new(cluster::Owners::new(
        smap,
        models::Bmd::new(uuid::Uuid::new_v4().to_string()),
        models::Rmd::new(),
        models::ClusterConfig::default(),
        persist_mpi,
    ));
    // Adopt anything newer that survived on disk.
    owners.smap.load_persisted();
    owners.bmd.load_persisted();
    owners.rmd.load_persisted();
    owners.config.load_persisted();

    let client = reqwest::Client::new();
    let recv = Arc::new(transport::RecvRegistry::new());
    let metasync = Arc::new(cluster::Metasync::new(args.node_id.clone(), client.clone()));

    let registry = Arc::new(if role == NodeRole::Target {
        node::target_registry(
            &args.node_id,
            mpi.clone(),
            owners.clone(),
            recv.clone(),
            client.clone(),
        )
    } else {
        xaction::Registry::new()
    });

    let shutdown = CancellationToken::new();
    let conf = owners.config.get();
    let executor = (role == NodeRole::Target).then(|| {
        txn::TargetExecutor::new(owners.clone(), mpi.clone(), registry.clone())
            .with_shutdown(shutdown.clone())
    });
    let coordinator = args.primary.then(|| {
        txn::Coordinator::new(
            args.node_id.clone(),
            client.clone(),
            owners.clone(),
            metasync.clone(),
            conf.timeout.host,
            conf.timeout.network,
            true,
        )
    });

    let node = Arc::new(node::Node {
        self_id: args.node_id.clone(),
        role,
        started: std::time::Instant::now(),
        owners: owners.clone(),
        mpi: mpi.clone(),
        registry,
        recv,
        metasync: metasync.clone(),
        executor,
        coordinator,
        locker: Arc::new(volume::NameLocker::new()),
        lom_cache: volume::LomCache::new(64 * 1024),
        client: client.clone(),
    });

    // Restart bookkeeping and interrupted-work resumption.
    if role == NodeRole::Target {
        let snap = mpi.snapshot();
        if volume::marker_exists(&snap, volume::Marker::NodeRestarted) {
            tracing::warn!("node_restarted marker present: unclean previous shutdown");
            let _ = volume::put_marker(&snap, volume::Marker::NodeRestartedPrev);
        }
        let _ = volume::put_marker(&snap, volume::Marker::NodeRestarted);
        node.resume_interrupted();
        volume::Vmd::persist(&snap, vmd_check.map(|v| v.version).unwrap_or(0))
            .context("persisting volume metadata")?;
    }

    // The metasync pump runs on the primary only; everyone else just
    // receives.
    if args.primary {
        tokio::spawn(metasync.clone().run(
            owners.clone(),
            conf.timeout.network,
            conf.timeout.max_probing,
            shutdown.clone(),
        ));
    }

    if let Some(join_url) = &args.join {
        join_cluster(&client, join_url, &self_snode).await?;
    }

    let addr = format!(
        "{}:{}",
        args.endpoint.host_str().unwrap_or("0.0.0.0"),
        args.endpoint.port().unwrap_or(8080)
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, node = %args.node_id, role = %role, primary = args.primary, "strand node is up");

    let app = server::router(node.clone());
    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = graceful.cancelled() => {}
            }
        })
        .await
        .context("http server failed")?;

    shutdown.cancel();
    node.shutdown();
    if role == NodeRole::Target {
        volume::remove_marker(&mpi.snapshot(), volume::Marker::NodeRestarted);
    }
    tracing::info!("strand node stopped");
    Ok(())
}

/// Announce this node to the primary; retried by the operator (or a
/// supervisor) on failure, not by us.
async fn join_cluster(
    client: &reqwest::Client,
    join_url: &url::Url,
    snode: &Snode,
) -> anyhow::Result<()> {
    let url = format!(
        "{}{}/join",
        join_url.as_str().trim_end_matches('/'),
        api::paths::CLUSTER
    );
    let resp = client
        .post(&url)
        .json(snode)
        .send()
        .await
        .context("join request failed")?;
    anyhow::ensure!(
        resp.status().is_success(),
        "join rejected: {}",
        resp.status()
    );
    tracing::info!(primary = %join_url, "joined the cluster");
    Ok(())
}
