//! Miniblog - serves blog posts over a Unix socket
//!
//! Posts are read from JSON files or a cloud table and cached in memory.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use miniblog::cache::{PostCache, RefreshPolicy};
use miniblog::config::{Backend, CliArgs, Command, LogFormat, PostsArgs, ServeArgs, StorageArgs};
use miniblog::ipc::IpcServer;
use miniblog::service::{BlogService, UploadStore};
use miniblog::store::{JsonFileStore, PostStore, TableStore};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Open the configured storage backend
async fn open_store(data_dir: &Path, storage: &StorageArgs) -> Result<Arc<dyn PostStore>> {
    match storage.backend {
        Backend::File => {
            let store = JsonFileStore::open(data_dir)
                .with_context(|| format!("Failed to open post folder under {}", data_dir.display()))?;
            Ok(Arc::new(store))
        }
        Backend::Table => {
            let settings = storage.table_settings()?;
            let store = TableStore::connect(&settings.endpoint, &settings.table_name, &settings.sas)
                .await
                .with_context(|| format!("Failed to connect to table {}", settings.table_name))?;
            Ok(Arc::new(store))
        }
    }
}

async fn serve(data_dir: &Path, args: ServeArgs) -> Result<()> {
    args.blog.validate()?;

    let store = open_store(data_dir, &args.storage).await?;
    let cache = PostCache::load(store, args.cache.refresh_policy())
        .await
        .context("Failed to load posts")?;

    let service = Arc::new(BlogService::new(
        Arc::new(cache),
        UploadStore::new(data_dir),
        args.blog,
    ));

    let mut server = IpcServer::new(Arc::clone(&service), args.socket, args.admin_token);
    if let Err(e) = server.start().await {
        error!(error = %e, "Failed to start socket server");
        return Err(e);
    }

    info!(owner = %service.options().owner, "Blog ready. Waiting for requests...");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "Socket server error");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
        }
    }

    service.cache().log_metrics().await;
    server.stop().await?;
    info!("Shutdown complete.");
    Ok(())
}

async fn list_posts(data_dir: &Path, args: PostsArgs) -> Result<()> {
    let store = open_store(data_dir, &args.storage).await?;
    let cache = PostCache::load(store, RefreshPolicy::Explicit)
        .await
        .context("Failed to load posts")?;

    let posts = cache.posts().await;
    if posts.is_empty() {
        println!("No posts.");
        return Ok(());
    }

    for post in posts.iter() {
        let date = post.pub_date.format(&Rfc3339)?;
        let state = if post.is_published { "published" } else { "draft" };
        println!("{date}  {state:<9}  {}  {}", post.encoded_link(), post.title);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_format);

    let data_dir = args.data_dir();
    info!(data_dir = %data_dir.display(), "Starting miniblog");

    match args.command {
        Command::Serve(serve_args) => serve(&data_dir, *serve_args).await,
        Command::Posts(posts_args) => list_posts(&data_dir, posts_args).await,
    }
}
