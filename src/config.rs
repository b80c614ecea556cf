//! Configuration: command line with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use crate::cache::RefreshPolicy;

/// Default Unix socket for the request server
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/miniblog.sock";
const DEFAULT_TABLE_NAME: &str = "posts";
const DEFAULT_FRESHNESS_SECS: u64 = 60 * 60;
const DEFAULT_OWNER: &str = "The Owner";
const DEFAULT_POSTS_PER_PAGE: usize = 4;
const DEFAULT_COMMENTS_CLOSE_AFTER_DAYS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the table backend requires --{0}")]
    MissingTableSetting(&'static str),
    #[error("--posts-per-page must be at least 1")]
    ZeroPageSize,
}

/// Command-line arguments for the miniblog binary.
#[derive(Debug, Parser)]
#[command(name = "miniblog", version, about = "Miniblog post server")]
pub struct CliArgs {
    /// Directory holding post files and uploads.
    #[arg(long, env = "MINIBLOG_DATA_DIR", value_name = "PATH", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, env = "MINIBLOG_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl CliArgs {
    /// Data directory, defaulting to the platform data dir
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("miniblog")
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve requests over the Unix socket.
    Serve(Box<ServeArgs>),
    /// Print every stored post and exit.
    Posts(PostsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Socket path to listen on.
    #[arg(long, env = "MINIBLOG_SOCKET", default_value = DEFAULT_SOCKET_PATH, value_name = "PATH")]
    pub socket: PathBuf,

    /// Token that promotes a connection to administrator.
    #[arg(long, env = "MINIBLOG_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub cache: CacheArgs,

    #[command(flatten)]
    pub blog: BlogOptions,
}

#[derive(Debug, Args)]
pub struct PostsArgs {
    #[command(flatten)]
    pub storage: StorageArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// JSON files under the data directory
    File,
    /// Remote table service
    Table,
}

/// Connection settings for the table backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSettings {
    pub endpoint: String,
    pub table_name: String,
    pub sas: String,
}

#[derive(Debug, Args)]
pub struct StorageArgs {
    /// Storage backend for posts.
    #[arg(long, env = "MINIBLOG_BACKEND", value_enum, default_value_t = Backend::File)]
    pub backend: Backend,

    /// Table service endpoint, e.g. https://account.table.core.windows.net
    #[arg(long, env = "MINIBLOG_TABLE_ENDPOINT", value_name = "URL")]
    pub table_endpoint: Option<String>,

    /// Table holding post rows.
    #[arg(long, env = "MINIBLOG_TABLE_NAME", default_value = DEFAULT_TABLE_NAME)]
    pub table_name: String,

    /// Shared access signature for the table.
    #[arg(long, env = "MINIBLOG_TABLE_SAS", hide_env_values = true)]
    pub table_sas: Option<String>,
}

impl StorageArgs {
    /// Table settings, failing if a required value is missing
    pub fn table_settings(&self) -> Result<TableSettings, ConfigError> {
        let endpoint = self
            .table_endpoint
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingTableSetting("table-endpoint"))?;
        let sas = self
            .table_sas
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingTableSetting("table-sas"))?;

        Ok(TableSettings {
            endpoint,
            table_name: self.table_name.clone(),
            sas,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CachePolicyKind {
    /// Reload on read once the freshness window has passed
    Windowed,
    /// Reload only on an administrator refresh
    Explicit,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    /// How the post cache decides to reload.
    #[arg(long, env = "MINIBLOG_CACHE_POLICY", value_enum, default_value_t = CachePolicyKind::Windowed)]
    pub cache_policy: CachePolicyKind,

    /// Freshness window in seconds for the windowed policy.
    #[arg(long, env = "MINIBLOG_FRESHNESS_SECS", default_value_t = DEFAULT_FRESHNESS_SECS)]
    pub freshness_secs: u64,
}

impl CacheArgs {
    pub fn refresh_policy(&self) -> RefreshPolicy {
        match self.cache_policy {
            CachePolicyKind::Windowed => {
                RefreshPolicy::Windowed(Duration::from_secs(self.freshness_secs))
            }
            CachePolicyKind::Explicit => RefreshPolicy::Explicit,
        }
    }
}

/// How post lists are rendered by front ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ListView {
    TitlesOnly,
    TitlesAndExcerpts,
    FullPosts,
}

/// Blog presentation and comment settings
#[derive(Debug, Clone, Args, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlogOptions {
    /// Blog owner shown by front ends.
    #[arg(long, env = "MINIBLOG_OWNER", default_value = DEFAULT_OWNER)]
    pub owner: String,

    /// Posts per page when a list request gives no count.
    #[arg(long, env = "MINIBLOG_POSTS_PER_PAGE", default_value_t = DEFAULT_POSTS_PER_PAGE)]
    pub posts_per_page: usize,

    /// Days after publishing during which comments are accepted.
    #[arg(long, env = "MINIBLOG_COMMENTS_CLOSE_AFTER_DAYS", default_value_t = DEFAULT_COMMENTS_CLOSE_AFTER_DAYS)]
    pub comments_close_after_days: u32,

    /// Post list layout.
    #[arg(long, env = "MINIBLOG_LIST_VIEW", value_enum, default_value_t = ListView::TitlesAndExcerpts)]
    pub list_view: ListView,
}

impl BlogOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.posts_per_page == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        Ok(())
    }
}

impl Default for BlogOptions {
    fn default() -> Self {
        Self {
            owner: DEFAULT_OWNER.to_string(),
            posts_per_page: DEFAULT_POSTS_PER_PAGE,
            comments_close_after_days: DEFAULT_COMMENTS_CLOSE_AFTER_DAYS,
            list_view: ListView::TitlesAndExcerpts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn serve_args(args: &[&str]) -> ServeArgs {
        let mut argv = vec!["miniblog", "serve"];
        argv.extend_from_slice(args);
        match CliArgs::try_parse_from(argv).unwrap().command {
            Command::Serve(serve) => *serve,
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let serve = serve_args(&[]);
        assert_eq!(serve.socket, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(serve.storage.backend, Backend::File);
        assert_eq!(
            serve.cache.refresh_policy(),
            RefreshPolicy::Windowed(Duration::from_secs(3600))
        );
        assert_eq!(serve.blog.posts_per_page, 4);
        assert_eq!(serve.blog.comments_close_after_days, 10);
        assert_eq!(serve.blog.list_view, ListView::TitlesAndExcerpts);
    }

    #[test]
    fn test_explicit_cache_policy() {
        let serve = serve_args(&["--cache-policy", "explicit"]);
        assert_eq!(serve.cache.refresh_policy(), RefreshPolicy::Explicit);
    }

    #[test]
    fn test_table_settings_require_endpoint_and_sas() {
        let serve = serve_args(&["--backend", "table"]);
        assert_eq!(
            serve.storage.table_settings(),
            Err(ConfigError::MissingTableSetting("table-endpoint"))
        );

        let serve = serve_args(&[
            "--backend",
            "table",
            "--table-endpoint",
            "https://acct.table.example.net",
            "--table-sas",
            "sv=1&sig=x",
        ]);
        let settings = serve.storage.table_settings().unwrap();
        assert_eq!(settings.table_name, "posts");
        assert_eq!(settings.sas, "sv=1&sig=x");
    }

    #[test]
    fn test_global_data_dir_after_subcommand() {
        let args =
            CliArgs::try_parse_from(["miniblog", "posts", "--data-dir", "/srv/blog"]).unwrap();
        assert_eq!(args.data_dir(), PathBuf::from("/srv/blog"));
        assert!(matches!(args.command, Command::Posts(_)));
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let options = BlogOptions {
            posts_per_page: 0,
            ..BlogOptions::default()
        };
        assert_eq!(options.validate(), Err(ConfigError::ZeroPageSize));
        assert!(BlogOptions::default().validate().is_ok());
    }
}
