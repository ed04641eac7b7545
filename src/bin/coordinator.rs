use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use serde::Serialize;
use serde_json::json;
use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::*;

use fl_coordinator::{
    crypto,
    services::{Authenticator, DevAuthenticator, ServiceError, Services},
    settings::Settings,
    storage::{redis, KeyValueStore},
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, long, parse(from_os_str))]
    config_path: PathBuf,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Runs the aggregation scheduler until ctrl-c
    Run,
    /// Submits a signed update
    Submit {
        /// Path of the raw update
        #[structopt(long, parse(from_os_str))]
        payload: PathBuf,
        /// Hex encoded signature of the raw update
        #[structopt(long)]
        signature: String,
        /// Identity of the uploader
        #[structopt(long)]
        user: String,
    },
    /// Prints the signature of an update
    Sign {
        /// Path of the raw update
        #[structopt(long, parse(from_os_str))]
        payload: PathBuf,
    },
    /// Runs an aggregation round
    Aggregate {
        #[structopt(long)]
        model: String,
        /// Identity of the operator
        #[structopt(long, default_value = "operator")]
        user: String,
    },
    /// Prints a model version and the version history
    Model {
        #[structopt(long)]
        model: String,
        #[structopt(long)]
        version: Option<u64>,
    },
    /// Prints the aggregation parameters and the pending updates of a model
    Metrics {
        #[structopt(long)]
        model: String,
    },
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        log: log_settings,
        store: store_settings,
        redis: redis_settings,
        security: security_settings,
        aggregation: aggregation_settings,
        retention: retention_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .init();

    if let Command::Sign { payload } = &opt.command {
        let raw = read_payload(payload);
        print(&json!({
            "signature": crypto::sign(&raw, security_settings.hmac_secret.expose())
        }));
        return;
    }

    if !store_settings.backend.is_shared() {
        eprintln!(
            "the {:?} backend keeps its state inside one process, \
             the coordinator binary needs a shared backend such as redis",
            store_settings.backend
        );
        process::exit(1);
    }

    let store = redis::Client::new(redis_settings.url, store_settings.retry_policy())
        .await
        .unwrap_or_else(|err| {
            eprintln!("failed to connect to redis: {}", err);
            process::exit(1);
        });
    let services = Services::new(
        store,
        security_settings,
        aggregation_settings,
        retention_settings,
    );
    execute(services, opt.command).await
}

async fn execute<S: KeyValueStore>(mut services: Services<S>, command: Command) {
    if let Err(err) = services.is_ready().await {
        eprintln!("the store is not ready: {}", err);
        process::exit(1);
    }

    let result = match command {
        Command::Run => {
            services.scheduler().run(shutdown()).await;
            info!("shutting down");
            return;
        }
        Command::Submit {
            payload,
            signature,
            user,
        } => {
            let raw = read_payload(&payload);
            match DevAuthenticator.authenticate(Some(&user)).await {
                Ok(caller) => services
                    .submit_update(&raw, &signature, &caller)
                    .await
                    .map(|accepted| json!(accepted)),
                Err(err) => Err(err),
            }
        }
        Command::Aggregate { model, user } => {
            match DevAuthenticator.authenticate(Some(&user)).await {
                Ok(caller) => services
                    .trigger_aggregation(&model, &caller)
                    .await
                    .map(|outcome| json!(outcome)),
                Err(err) => Err(err),
            }
        }
        Command::Model { model, version } => services
            .read_model(&model, version)
            .await
            .map(|view| json!(view)),
        Command::Metrics { model } => services
            .read_metrics(&model)
            .await
            .map(|metrics| json!(metrics)),
        Command::Sign { .. } => return,
    };

    match result {
        Ok(output) => print(&output),
        Err(err) => {
            print(&failure(&err));
            process::exit(1);
        }
    }
}

async fn shutdown() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("listening for ctrl-c failed: {}", err);
    }
}

fn failure(err: &ServiceError) -> serde_json::Value {
    match err.rejected_reason() {
        Some(reason) => json!({ "accepted": false, "reason": reason }),
        None => json!({ "error": err.to_string(), "transient": err.is_transient() }),
    }
}

fn read_payload(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap_or_else(|err| {
        eprintln!("failed to read {}: {}", path.display(), err);
        process::exit(1);
    })
}

fn print<T: Serialize>(output: &T) {
    match serde_json::to_string_pretty(output) {
        Ok(output) => println!("{}", output),
        Err(err) => {
            eprintln!("failed to serialize the output: {}", err);
            process::exit(1);
        }
    }
}
