use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use cra_core::client::ClientLibrary;
use cra_core::config::{ClientConfig, MetadataConfig, WorkerConfig};
use cra_core::metadata::DataProvider;
use cra_core::vertex::ShardingInfo;
use cra_core::worker::Worker;
use cra_dataflow::deploy::{deployment_names, load_topology};
use cra_dataflow::{
    Dataset, DeploymentDescriptor, FunctionRegistry, Record, ShardedDataset,
    operator_vertex_registry,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cra")]
#[command(about = "CRA worker and metadata CLI", long_about = None)]
struct Cli {
    /// Metadata directory; defaults to $CRA_METADATA_ROOT or the temp dir.
    #[arg(long, global = true)]
    metadata_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host vertices until interrupted.
    Worker {
        #[arg(long)]
        instance: String,
        #[arg(long, default_value_t = 0)]
        port: u16,
        #[arg(long)]
        ip: Option<IpAddr>,
        #[arg(long, default_value_t = 10_000)]
        heartbeat_ms: u64,
        #[arg(long)]
        no_recover: bool,
    },
    Instances,
    Vertices,
    Connections {
        vertex: String,
    },
    /// List stored deployments, or the tasks of one.
    Deployments {
        name: Option<String>,
    },
    /// Deploy the shift-up demo pipeline on running workers and print the
    /// result sizes.
    Demo {
        #[arg(long, required = true, value_delimiter = ',')]
        instances: Vec<String>,
        #[arg(long, default_value_t = 4)]
        shards: u32,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Delete every metadata row and blob.
    Reset,
}

/// Functions every CLI worker hosts.
fn demo_functions() -> FunctionRegistry {
    let mut functions = FunctionRegistry::new();
    functions.register_producer("demo::range", |shard, _: &ShardingInfo| {
        let start = shard as i64 * 100;
        Ok((start..start + 100)
            .map(|v| Record::int(v as u64, v))
            .collect())
    });
    functions.register_unary("demo::shift-up", |dataset: Dataset| {
        dataset
            .records
            .iter()
            .map(|r| Ok(Record::int(r.key, r.as_int()? + 1)))
            .collect::<Result<Vec<_>>>()
            .map(Dataset::new)
    });
    functions
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let metadata = match cli.metadata_root {
        Some(root) => MetadataConfig::new(root),
        None => MetadataConfig::from_env(),
    };
    let data = DataProvider::file_backed(&metadata);

    match cli.command {
        Commands::Worker {
            instance,
            port,
            ip,
            heartbeat_ms,
            no_recover,
        } => {
            let mut config =
                WorkerConfig::new(instance, port).with_heartbeat(Duration::from_millis(heartbeat_ms));
            if let Some(ip) = ip {
                config = config.with_ip(ip);
            }
            if no_recover {
                config = config.without_recovery();
            }
            let registry = Arc::new(operator_vertex_registry(Arc::new(demo_functions())));
            let worker = Worker::start(config, data, registry, None).await?;
            println!(
                "worker {} listening on {}:{}",
                worker.instance_name(),
                worker.address(),
                worker.port()
            );
            tokio::signal::ctrl_c().await?;
            worker.shutdown().await;
        }
        Commands::Instances => {
            let client = ClientLibrary::new(data, ClientConfig::default());
            for instance in client.instance_names().await? {
                let alive = client.is_instance_alive(&instance).await?;
                println!("{} alive={}", instance, alive);
            }
        }
        Commands::Vertices => {
            let client = ClientLibrary::new(data, ClientConfig::default());
            for vertex in client.vertex_names().await? {
                println!("{}", vertex);
            }
        }
        Commands::Connections { vertex } => {
            let client = ClientLibrary::new(data, ClientConfig::default());
            let (outgoing, incoming) = client.vertex_connections(&vertex).await?;
            println!("outgoing={}", outgoing.len());
            for connection in outgoing {
                println!("  {}", connection);
            }
            println!("incoming={}", incoming.len());
            for connection in incoming {
                println!("  {}", connection);
            }
        }
        Commands::Deployments { name: None } => {
            for name in deployment_names(&data).await? {
                println!("{}", name);
            }
        }
        Commands::Deployments { name: Some(name) } => {
            let topology = load_topology(&data, &name)
                .await?
                .ok_or_else(|| anyhow!("no deployment named {}", name))?;
            for task in topology.tasks() {
                let transforms: Vec<&str> =
                    task.transforms.iter().map(|e| e.function.as_str()).collect();
                println!("{} transforms={:?}", task.task_id, transforms);
                for connection in task.outgoing() {
                    println!(
                        "  {} -> {}.{} ({:?})",
                        connection.from_endpoint,
                        connection.to_vertex,
                        connection.to_endpoint,
                        connection.pattern
                    );
                }
            }
        }
        Commands::Demo {
            instances,
            shards,
            timeout_secs,
        } => {
            let client = ClientLibrary::new(data, ClientConfig::default());
            let functions = Arc::new(demo_functions());
            let mut subscription = ShardedDataset::produce("demo::range")
                .transform("demo::shift-up")
                .shuffle_by_key()
                .transform("demo::shift-up")
                .deploy(
                    &client,
                    functions,
                    DeploymentDescriptor::new("demo")
                        .with_instances(instances)
                        .with_shard_count(shards),
                )
                .await?;
            let results =
                tokio::time::timeout(Duration::from_secs(timeout_secs), subscription.collect())
                    .await;
            let outcome = match results {
                Ok(Ok(results)) => {
                    for (shard, dataset) in &results {
                        println!("shard {} records={}", shard, dataset.len());
                    }
                    Ok(())
                }
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(anyhow!("demo timed out after {}s", timeout_secs)),
            };
            subscription.close(&client).await;
            outcome?;
        }
        Commands::Reset => {
            let client = ClientLibrary::new(data, ClientConfig::default());
            client.reset().await?;
            println!("metadata reset");
        }
    }
    Ok(())
}
