use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_listener::Listener;
use tokio_listener::SystemOptions;
use tokio_listener::UserOptions;
use tonic::transport::Server;
use tracing::info;
use tracing::warn;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use axon::perms::{AllowAll, Authorizer, StaticAuthorizer};
use axon::proto::axon_service_server::AxonServiceServer;
use axon::proto::GRPCAxonServiceWrapper;
use axon::service::{self, AxonService, RedbAxonService};
use axon::Sha256Digest;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the axon daemon.
    Daemon {
        #[arg(long, short = 'l')]
        listen_address: Option<String>,

        /// Directory holding the axon.redb and blob.redb databases.
        /// Created if absent.
        #[arg(long, env, default_value = "/var/lib/axon")]
        data_directory: PathBuf,

        /// JSON file mapping user names to lists of capability grants,
        /// e.g. {"alice": ["axon:has"], "sync": ["axon"]}.
        /// Without it, every caller is allowed everything.
        #[arg(long, env)]
        grants_file: Option<PathBuf>,
    },
    /// Uploads a list of files, printing size and digest for each of them.
    Put {
        #[clap(value_name = "FILE")]
        paths: Vec<PathBuf>,

        #[arg(long, env, default_value = "grpc+http://[::1]:8080")]
        axon_service_addr: String,
    },
    /// Streams the blob with the given hex digest to stdout.
    Get {
        #[clap(value_name = "SHA256")]
        digest: String,

        #[arg(long, env, default_value = "grpc+http://[::1]:8080")]
        axon_service_addr: String,
    },
    /// Prints the counter snapshot as JSON.
    Metrics {
        #[arg(long, env, default_value = "grpc+http://[::1]:8080")]
        axon_service_addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // configure log settings
    let level = cli.log_level.unwrap_or(Level::INFO);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .compact()
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(level.into())
                        .from_env()
                        .expect("invalid RUST_LOG"),
                ),
        )
        .try_init()?;

    match cli.command {
        Commands::Daemon {
            listen_address,
            data_directory,
            grants_file,
        } => {
            let axon = Arc::new(RedbAxonService::new(data_directory).await?);

            let auth: Arc<dyn Authorizer> = match grants_file {
                Some(path) => {
                    let grants = tokio::fs::read(&path).await?;
                    Arc::new(StaticAuthorizer::new(serde_json::from_slice(&grants)?))
                }
                None => {
                    warn!("no grants file configured, allowing every caller everything");
                    Arc::new(AllowAll)
                }
            };

            let listen_address = listen_address
                .unwrap_or_else(|| "[::]:8080".to_string())
                .parse()
                .unwrap();

            let router = Server::builder().add_service(AxonServiceServer::new(
                GRPCAxonServiceWrapper::new(axon, auth),
            ));

            info!(listen_address=%listen_address, "starting daemon");

            let listener = Listener::bind(
                &listen_address,
                &SystemOptions::default(),
                &UserOptions::default(),
            )
            .await?;

            router.serve_with_incoming(listener).await?;
        }
        Commands::Put {
            paths,
            axon_service_addr,
        } => {
            let axon = service::from_addr(&axon_service_addr).await?;

            for path in paths {
                let byts = tokio::fs::read(&path).await?;
                let (size, digest) = axon.put(byts.into()).await?;
                println!("{} {}", size, digest);
            }
        }
        Commands::Get {
            digest,
            axon_service_addr,
        } => {
            let axon = service::from_addr(&axon_service_addr).await?;

            let digest: Sha256Digest = data_encoding::HEXLOWER_PERMISSIVE
                .decode(digest.as_bytes())?
                .try_into()?;

            let mut chunks = axon.get(&digest).await?;
            let mut stdout = tokio::io::stdout();
            while let Some(byts) = chunks.try_next().await? {
                stdout.write_all(&byts).await?;
            }
            stdout.flush().await?;
        }
        Commands::Metrics { axon_service_addr } => {
            let axon = service::from_addr(&axon_service_addr).await?;

            let snapshot = axon.metrics().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    };
    Ok(())
}
