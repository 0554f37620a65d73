use anyhow::{Context, Result};
use cargit::config::ensure_auth_cookie;
use cargit::{CargitServer, Config, RegistryIndex};
use cargit_git::{GitProtocolServer, PersonIdent, Repositories};
use clap::{Parser, Subcommand};
use lmdb_asset_store::LmdbAssetStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "cargit")]
#[command(about = "Git smart HTTP server and cargo registry index", long_about = None)]
struct Cli {
    /// Data directory (defaults to storage.data_dir from the config file)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the git smart HTTP server
    Start {
        /// Listen address (defaults to server.bind_address)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Create an empty repository
    CreateRepo {
        /// Repository name
        name: String,
    },
    /// List the refs of a repository
    Refs {
        /// Repository name
        name: String,
        /// Show only this ref; short names like `master` are expanded
        reference: Option<String>,
    },
    /// Show storage statistics
    Stats {
        /// Also count the objects of this repository
        name: Option<String>,
    },
    /// Write config.json into the registry index
    WriteConfig {
        /// Public URL of the registry
        url: String,
    },
}

fn open_repositories(config: &Config, data_dir: Option<PathBuf>) -> Result<Repositories> {
    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&config.storage.data_dir));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let store = LmdbAssetStore::with_map_size(&data_dir, config.storage.map_size_bytes())
        .with_context(|| format!("Failed to open store at {}", data_dir.display()))?;
    info!("opened store at {}", data_dir.display());
    Ok(Repositories::new(Arc::new(store)).with_big_file_threshold(config.git.big_file_threshold))
}

fn registry_index(config: &Config, repositories: &Repositories) -> RegistryIndex {
    let identity = PersonIdent::new(&config.registry.system_name, &config.registry.system_email);
    RegistryIndex::new(repositories.clone(), &config.git.index_repository, identity)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cargit=info,cargit_git=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let repositories = open_repositories(&config, cli.data_dir)?;

    match cli.command {
        Commands::Start { addr } => {
            let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());

            // The index must exist before the first fetch arrives
            let index = registry_index(&config, &repositories);
            index.initialize()?;
            if let Some(url) = &config.registry.url {
                if let Some(commit) = index.write_config_json(url, &config.registry.allowed_registries)? {
                    info!("registry config.json updated in {}", commit);
                }
            }

            let mut server = CargitServer::new(GitProtocolServer::new(repositories), addr.clone());

            println!("Starting cargit on {}", addr);
            println!("Git remote: http://{}/git/<repo>", addr);
            println!("Registry index: http://{}/git/{}", addr, config.git.index_repository);

            if config.server.enable_auth {
                let (username, password) = ensure_auth_cookie()?;
                println!("Push credentials: {}:{}", username, password);
                server = server.with_auth(username, password);
            } else {
                println!("Auth: disabled");
            }

            server.run().await?;
        }
        Commands::CreateRepo { name } => {
            repositories
                .store()
                .write_with(|txn| repositories.create_repository(txn, &name).map(|_| ()))
                .with_context(|| format!("Failed to create repository {}", name))?;
            println!("Created repository: {}", name);
        }
        Commands::Refs { name, reference } => {
            let txn = repositories.store().read_txn()?;
            let Some(handle) = repositories.get_repository(&txn, &name)? else {
                anyhow::bail!("Repository not found: {}", name);
            };
            let refs = handle.refs();
            let listed = match reference {
                Some(short) => match refs.find_ref(&txn, &short)? {
                    Some(named) => vec![named],
                    None => anyhow::bail!("Ref not found: {}", short),
                },
                None => refs.find_by_prefix(&txn, "")?,
            };
            for named in listed {
                match &named.reference {
                    cargit_git::Ref::Symbolic(target) => println!("ref: {}\t{}", target, named.name),
                    reference => {
                        if let Some(id) = reference.object_id() {
                            println!("{}\t{}", id, named.name);
                        }
                        if let Some(peeled) = reference.peeled_id() {
                            println!("{}\t{}^{{}}", peeled, named.name);
                        }
                    }
                }
            }
        }
        Commands::Stats { name } => {
            let stats = repositories.store().stats()?;
            println!("Storage Statistics:");
            println!("  Containers: {}", stats.containers);
            println!("  Assets: {}", stats.assets);
            println!("  Blobs: {}", stats.blobs);
            println!("  Blob size: {} bytes ({:.2} KB)",
                stats.blob_bytes,
                stats.blob_bytes as f64 / 1024.0);
            if let Some(name) = name {
                let txn = repositories.store().read_txn()?;
                let Some(handle) = repositories.get_repository(&txn, &name)? else {
                    anyhow::bail!("Repository not found: {}", name);
                };
                println!("  Objects in {}: {}", name, handle.objects().count(&txn)?);
            }
        }
        Commands::WriteConfig { url } => {
            let index = registry_index(&config, &repositories);
            match index.write_config_json(&url, &config.registry.allowed_registries)? {
                Some(commit) => println!("Committed config.json: {}", commit),
                None => println!("config.json already up to date"),
            }
        }
    }

    Ok(())
}
