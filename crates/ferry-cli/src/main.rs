mod cli;
mod uploader;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ferry_core::FerryConfig;
use ferry_core::app::{FerryBuilder, open_store};
use ferry_core::domain::{ItemId, Metadata, StateFilter};
use ferry_core::ports::{QueueStore, SystemClock};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, LogFormat};
use uploader::CopyUploader;

const DEFAULT_DB: &str = "ferry.db";

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut config = match &cli.config {
        Some(path) => FerryConfig::load_from_path(path)?,
        None => FerryConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.store.path = Some(db.clone());
    } else if config.store.path.is_none() {
        config.store.path = Some(DEFAULT_DB.into());
    }

    match cli.command {
        Command::Enqueue { content_ref, meta } => {
            let store = open_store(&config, Arc::new(SystemClock)).await?;
            let metadata: Metadata = meta.into_iter().collect();
            let id = store.enqueue(&content_ref, metadata).await?;
            println!("{id}");
        }
        Command::Status => {
            let store = open_store(&config, Arc::new(SystemClock)).await?;
            let counts = store.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::List { state } => {
            let store = open_store(&config, Arc::new(SystemClock)).await?;
            list(store.as_ref(), state.into()).await?;
        }
        Command::Requeue { id } => {
            let id: ItemId = id.parse()?;
            let store = open_store(&config, Arc::new(SystemClock)).await?;
            if !store.requeue(id).await? {
                return Err(format!("{id} is not a failed item").into());
            }
            println!("requeued {id}");
        }
        Command::PurgeFailed => {
            let store = open_store(&config, Arc::new(SystemClock)).await?;
            let purged = store.purge_failed().await?;
            println!("purged {purged} failed item(s)");
        }
        Command::Wake {
            budget_secs,
            dest_dir,
        } => {
            let ferry = FerryBuilder::new(config)
                .uploader(Arc::new(CopyUploader::new(dest_dir)))
                .build()
                .await?;
            let budget = budget_secs.map_or(ferry.default_budget(), Duration::from_secs);
            let result = ferry.handle_wake(budget).await;
            println!("{}", serde_json::to_string(&result)?);
            ferry.shutdown().await;
        }
        Command::Call { method, dest_dir } => {
            let ferry = FerryBuilder::new(config)
                .uploader(Arc::new(CopyUploader::new(dest_dir)))
                .build()
                .await?;
            let reply = ferry.channel().invoke(&method).await;
            ferry.shutdown().await;
            println!("{}", reply?);
        }
    }

    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn list(store: &dyn QueueStore, filter: StateFilter) -> CliResult {
    for item in store.list(filter).await? {
        println!("{}", serde_json::to_string(&item)?);
    }
    Ok(())
}
