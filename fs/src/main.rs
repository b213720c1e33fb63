use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;

use gcsfuse::clock::system_clock;
use gcsfuse::config::{self, Cli};
use gcsfuse::dispatcher::{Dispatcher, FsWrapper};
use gcsfuse::object_client::{HttpObjectClient, ObjectClientFacade, RetryPolicy};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match config::load(cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if config.bucket.is_empty() {
        tracing::error!("--bucket is required");
        std::process::exit(1);
    }

    let base_url = match url::Url::parse(&config.endpoint) {
        Ok(u) => u,
        Err(e) => {
            tracing::error!(error = %e, endpoint = %config.endpoint, "invalid --endpoint");
            std::process::exit(1);
        }
    };

    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to start the tokio runtime"),
    );

    let object_client = Arc::new(ObjectClientFacade::new(
        HttpObjectClient::new(base_url),
        RetryPolicy::default(),
    ));

    let mount_point = config.mount_point.clone();
    let dispatcher = match Dispatcher::new(config, object_client, system_clock()) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize filesystem state");
            std::process::exit(1);
        }
    };

    let options = vec![
        MountOption::FSName("gcsfuse".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];

    tracing::info!(mount_point = %mount_point.display(), "mounting");
    let wrapper = FsWrapper::new(dispatcher, runtime);
    if let Err(e) = fuser::mount2(wrapper, &mount_point, &options) {
        tracing::error!(error = %e, "mount failed");
        std::process::exit(1);
    }
}
