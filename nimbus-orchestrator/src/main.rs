use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nimbus_common::ClusterNetwork;
use nimbus_orchestrator::directory;
use nimbus_orchestrator::provider_manager::ProviderManager;
use nimbus_orchestrator::{ClusterBootstrapper, CreateClusterRequest, ScaleOptions, Settings};
use nimbus_providers::inventory::PoolQuery;
use std::net::Ipv4Addr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "nimbus-orchestrator",
    about = "Create, grow and tear down clusters on the control plane",
    version,
    after_help = "The admin password is read from CLUSTER_ADMIN_PASSWORD (or CLUSTER_ADMIN_PASSWORD_FILE)."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bootstrap a new cluster
    Create {
        name: String,
        machine_type: String,
        nodes: u32,
        #[command(flatten)]
        addressing: Addressing,
        /// Reserve addresses one by one instead of a contiguous block
        #[arg(long)]
        noncontiguous: bool,
        /// Configure only the first node's addresses, not the cluster ones
        #[arg(long)]
        skip_node_config: bool,
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Add nodes to an existing cluster
    Scale {
        name: String,
        count: u32,
        #[arg(long)]
        mgmt_ip: Ipv4Addr,
        #[arg(long)]
        netmask: Ipv4Addr,
        /// Cluster address range, FIRST-LAST
        #[arg(long, value_parser = parse_range)]
        range: (Ipv4Addr, Ipv4Addr),
        #[command(flatten)]
        node: NodeArgs,
    },
    /// Destroy every node of a cluster
    Destroy { name: String },
    /// List instances, optionally filtered by name prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
}

/// Explicit addressing; all three or none.
#[derive(Debug, Args)]
struct Addressing {
    #[arg(long, requires_all = ["netmask", "range"])]
    mgmt_ip: Option<Ipv4Addr>,
    #[arg(long, requires = "mgmt_ip")]
    netmask: Option<Ipv4Addr>,
    /// Cluster address range, FIRST-LAST
    #[arg(long, value_parser = parse_range, requires = "mgmt_ip")]
    range: Option<(Ipv4Addr, Ipv4Addr)>,
}

#[derive(Debug, Args)]
struct NodeArgs {
    /// Extra template attribute, KEY=VALUE (repeatable)
    #[arg(long = "opt", value_parser = parse_option)]
    options: Vec<(String, String)>,
    /// Leave created nodes in place when something fails
    #[arg(long)]
    skip_cleanup: bool,
}

fn parse_range(raw: &str) -> Result<(Ipv4Addr, Ipv4Addr), String> {
    let (first, last) = raw.split_once('-').ok_or("expected FIRST-LAST")?;
    let first = first.trim().parse::<Ipv4Addr>().map_err(|e| format!("first address: {}", e))?;
    let last = last.trim().parse::<Ipv4Addr>().map_err(|e| format!("last address: {}", e))?;
    Ok((first, last))
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw.split_once('=').ok_or("expected KEY=VALUE")?;
    Ok((key.trim().to_string(), value.to_string()))
}

fn admin_password() -> Result<String> {
    if let Ok(direct) = std::env::var("CLUSTER_ADMIN_PASSWORD") {
        if !direct.trim().is_empty() {
            return Ok(direct.trim().to_string());
        }
    }
    let path = std::env::var("CLUSTER_ADMIN_PASSWORD_FILE")
        .context("CLUSTER_ADMIN_PASSWORD or CLUSTER_ADMIN_PASSWORD_FILE must be set")?;
    let contents = std::fs::read_to_string(path.trim()).context("reading CLUSTER_ADMIN_PASSWORD_FILE")?;
    Ok(contents.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let settings = Settings::from_env()?;
    tracing::info!("🚀 [orchestrator] provider: {}", ProviderManager::current_provider_name(&settings));
    let pool = ProviderManager::connection_pool(&settings)?;
    let bootstrapper = ClusterBootstrapper::new(
        &settings,
        pool.clone(),
        ProviderManager::address_allocator(&settings)?,
        ProviderManager::management_connector(&settings),
    );

    match cli.command {
        Command::Create {
            name,
            machine_type,
            nodes,
            addressing,
            noncontiguous,
            skip_node_config,
            node,
        } => {
            let mut request = CreateClusterRequest::new(&name, &machine_type, nodes, &admin_password()?);
            request.mgmt_ip = addressing.mgmt_ip;
            request.netmask = addressing.netmask;
            request.cluster_ip_start = addressing.range.map(|r| r.0);
            request.cluster_ip_end = addressing.range.map(|r| r.1);
            request.contiguous_addresses = !noncontiguous;
            request.skip_cleanup = node.skip_cleanup;
            request.skip_node_config = skip_node_config;
            request.options = node.options;

            let cluster = bootstrapper.create_cluster(&request).await?;
            println!("{}", serde_json::to_string_pretty(&cluster)?);
        }
        Command::Scale {
            name,
            count,
            mgmt_ip,
            netmask,
            range: (start, end),
            node,
        } => {
            let mut cluster = bootstrapper.discover_cluster(&name).await?;
            cluster.network = Some(ClusterNetwork {
                mgmt_ip,
                netmask,
                cluster_ip_start: start,
                cluster_ip_end: end,
                cluster_ips: Vec::new(),
            });
            let options = ScaleOptions {
                skip_cleanup: node.skip_cleanup,
                options: node.options,
            };
            let added = bootstrapper.add_nodes(&mut cluster, count, &options).await?;
            for node in added {
                println!("{}\t{}", node.id, node.name);
            }
        }
        Command::Destroy { name } => {
            let mut cluster = bootstrapper.discover_cluster(&name).await?;
            bootstrapper.destroy_cluster(&mut cluster).await?;
            println!("destroyed {}", name);
        }
        Command::List { prefix } => {
            let conn = pool.checkout()?;
            let instances = directory::list(&*conn, &PoolQuery::default()).await?;
            for i in instances.iter().filter(|i| i.name.starts_with(&prefix)) {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    i.id,
                    i.name,
                    i.status,
                    i.ip.as_deref().unwrap_or("-"),
                    i.template_name.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
