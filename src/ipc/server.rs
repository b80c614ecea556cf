//! Socket Server - Unix socket server for blog front ends
//!
//! Each connection is a session that starts anonymous and can be promoted to
//! administrator with the configured token. Commands are dispatched to the
//! shared BlogService.

use anyhow::{Context, Result};
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::ipc::protocol::{
    parse_command, serialize_response, Command, Response, PROTOCOL_VERSION,
};
use crate::service::{BlogError, BlogService, Caller};

/// Socket server that listens for blog requests
pub struct IpcServer {
    service: Arc<BlogService>,
    socket_path: PathBuf,
    /// Token that promotes a session to administrator
    admin_token: Option<Arc<str>>,
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    pub fn new(
        service: Arc<BlogService>,
        socket_path: impl Into<PathBuf>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            service,
            socket_path: socket_path.into(),
            admin_token: admin_token.filter(|t| !t.is_empty()).map(Arc::from),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale socket file
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

        if self.admin_token.is_none() {
            warn!("No admin token configured, every session stays anonymous");
        }
        info!(socket_path = %self.socket_path.display(), "Socket server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let session = Session::new(Arc::clone(&self.service), self.admin_token.clone());
                    let connection_count = Arc::clone(&self.connection_count);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, session, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the server and clean up
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("Socket server stopped");
        Ok(())
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> u32 {
        *self.connection_count.read().await
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    mut session: Session,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Newline-delimited JSON, one response per request
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => session.handle(command).await,
                    Err(e) => {
                        warn!(error = %e, "Failed to parse command");
                        Response::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

fn failure(e: BlogError) -> Response {
    Response::Error {
        error: e.to_string(),
    }
}

fn success(message: impl Into<String>) -> Response {
    Response::Success {
        message: Some(message.into()),
    }
}

/// Per-connection state
struct Session {
    service: Arc<BlogService>,
    admin_token: Option<Arc<str>>,
    caller: Caller,
}

impl Session {
    fn new(service: Arc<BlogService>, admin_token: Option<Arc<str>>) -> Self {
        Self {
            service,
            admin_token,
            caller: Caller::anonymous(),
        }
    }

    /// Process a command and return a response
    async fn handle(&mut self, command: Command) -> Response {
        let service = &self.service;
        let caller = self.caller;

        match command {
            Command::Authenticate { token } => {
                if self.admin_token.as_deref() == Some(token.as_str()) {
                    self.caller = Caller::administrator();
                    info!("Session authenticated as administrator");
                    success("Authenticated")
                } else {
                    warn!("Rejected authentication attempt");
                    Response::Error {
                        error: "Authentication failed".to_string(),
                    }
                }
            }

            Command::ListPosts { count, skip } => {
                let count = count.unwrap_or(service.options().posts_per_page);
                let posts = service.posts_page(caller, count, skip.unwrap_or(0)).await;
                Response::Posts { posts }
            }

            Command::GetPost { id } => Response::Post {
                post: service.post_by_id(caller, &id).await,
            },

            Command::GetPostBySlug { slug } => Response::Post {
                post: service.post_by_slug(caller, &slug).await,
            },

            Command::PostsByYear => Response::PostsByYear {
                years: service.posts_by_year(caller).await,
            },

            Command::PostsByCategory { category } => Response::Posts {
                posts: service.posts_by_category(caller, &category).await,
            },

            Command::Categories => Response::Categories {
                categories: service.categories(caller).await,
            },

            Command::SavePost { post } => {
                info!(id = %post.id, "Processing savePost command");
                match service.save_post(caller, post).await {
                    Ok(saved) => Response::Post { post: Some(saved) },
                    Err(e) => failure(e),
                }
            }

            Command::DeletePost { id } => {
                info!(id = %id, "Processing deletePost command");
                let Some(post) = service.post_by_id(caller, &id).await else {
                    return failure(BlogError::PostNotFound(id));
                };
                match service.delete_post(caller, &post).await {
                    Ok(()) => success(format!("Deleted post {}", post.id)),
                    Err(e) => failure(e),
                }
            }

            Command::AddComment {
                post_id,
                author,
                email,
                content,
            } => match service
                .add_comment(caller, &post_id, &author, &email, &content)
                .await
            {
                Ok(comment) => Response::Comment { comment },
                Err(e) => failure(e),
            },

            Command::DeleteComment {
                post_id,
                comment_id,
            } => match service.delete_comment(caller, &post_id, &comment_id).await {
                Ok(()) => success(format!("Deleted comment {}", comment_id)),
                Err(e) => failure(e),
            },

            Command::SaveFile {
                file_name,
                suffix,
                data,
            } => {
                let bytes = match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return failure(BlogError::Validation(format!("file data is not base64: {e}")))
                    }
                };
                match service
                    .save_file(caller, &bytes, &file_name, suffix.as_deref())
                    .await
                {
                    Ok(path) => Response::FileSaved { path },
                    Err(e) => failure(e),
                }
            }

            Command::Refresh => match service.force_refresh(caller).await {
                Ok(()) => Response::Success { message: None },
                Err(e) => failure(e),
            },

            Command::GetStatus => {
                debug!("Processing getStatus command");
                let cache = service.cache();
                let stats = cache.stats().await;
                Response::Status {
                    version: PROTOCOL_VERSION,
                    backend: cache.store().name().to_string(),
                    backend_health: cache.store().health().to_string(),
                    recent_errors: cache.store().recent_errors(),
                    posts: stats.entries,
                    cache: stats,
                    options: service.options().clone(),
                }
            }
        }
    }
}
