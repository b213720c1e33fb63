use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use refstore::Store;

/// Reference flat-namespace object store, serving the object API
/// surface `gcsfuse` talks to.
#[derive(Parser, Debug)]
#[command(name = "refstore", about = "Reference flat-namespace object store")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9000")]
    listen: SocketAddr,

    /// Directory objects are stored under.
    #[arg(long, default_value = "./refstore-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refstore=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let store = match Store::new(cli.data_dir.clone()).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, dir = %cli.data_dir.display(), "failed to prepare data directory");
            std::process::exit(1);
        }
    };

    let app = refstore::router(store);

    tracing::info!(addr = %cli.listen, "listening");
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", cli.listen));
    axum::serve(listener, app).await.unwrap();
}
