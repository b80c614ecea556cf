//! Table Service REST Client
//!
//! Talks to an Azure-Table-compatible REST endpoint authorized with a SAS token.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::entity::{Continuation, PostEntity, QueryResponse};
use super::errors::TableError;

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Maximum number of recent errors to track
const MAX_ERROR_HISTORY: usize = 10;

/// REST API version sent with every request
const API_VERSION: &str = "2019-02-02";

const ACCEPT_NO_METADATA: &str = "application/json;odata=nometadata";

const NEXT_PARTITION_HEADER: &str = "x-ms-continuation-NextPartitionKey";
const NEXT_ROW_HEADER: &str = "x-ms-continuation-NextRowKey";

/// Health status values
pub const HEALTH_HEALTHY: u8 = 0;
pub const HEALTH_DEGRADED: u8 = 1;
pub const HEALTH_UNHEALTHY: u8 = 2;

/// A recent error entry for tracking
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub timestamp: i64,
    pub operation: String,
    pub key: String,
    pub error: String,
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = OffsetDateTime::from_unix_timestamp(self.timestamp)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.timestamp.to_string());
        write!(f, "{} {} {}: {}", at, self.operation, self.key, self.error)
    }
}

/// Client for one table
#[derive(Clone)]
pub struct TableClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Account endpoint, e.g. `https://account.table.core.windows.net`
    endpoint: String,
    /// Table holding the rows
    table_name: String,
    /// SAS query string without the leading `?`
    sas: String,
    /// Connection health (0=healthy, 1=degraded, 2=unhealthy)
    health: Arc<AtomicU8>,
    /// Recent error log
    error_log: Arc<RwLock<VecDeque<ErrorEntry>>>,
}

impl TableClient {
    /// Build a client without touching the network
    pub fn new(endpoint: &str, table_name: &str, sas: &str) -> Result<Self, TableError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TableError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            table_name: table_name.to_string(),
            sas: sas.trim_start_matches('?').to_string(),
            health: Arc::new(AtomicU8::new(HEALTH_HEALTHY)),
            error_log: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_ERROR_HISTORY))),
        })
    }

    /// Build a client and make sure the table exists
    pub async fn connect(endpoint: &str, table_name: &str, sas: &str) -> Result<Self, TableError> {
        info!(endpoint = endpoint, table = table_name, "Connecting to table service...");

        let client = Self::new(endpoint, table_name, sas)?;
        client.ensure_table().await?;

        info!(table = table_name, "Table client ready");
        Ok(client)
    }

    /// Table name
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn with_sas(&self, url: String) -> String {
        if self.sas.is_empty() {
            url
        } else if url.contains('?') {
            format!("{}&{}", url, self.sas)
        } else {
            format!("{}?{}", url, self.sas)
        }
    }

    /// URL addressing a single entity
    pub(crate) fn entity_url(&self, partition_key: &str, row_key: &str) -> String {
        self.with_sas(format!(
            "{}/{}(PartitionKey='{}',RowKey='{}')",
            self.endpoint,
            self.table_name,
            encode_key(partition_key),
            encode_key(row_key)
        ))
    }

    /// URL for one page of a query, optionally limited to one partition
    pub(crate) fn query_url(
        &self,
        partition_key: Option<&str>,
        continuation: Option<&Continuation>,
    ) -> String {
        let mut params = Vec::new();

        if let Some(partition_key) = partition_key {
            let filter = format!("PartitionKey eq '{}'", partition_key.replace('\'', "''"));
            params.push(format!("$filter={}", urlencoding::encode(&filter)));
        }

        if let Some(token) = continuation {
            params.push(format!(
                "NextPartitionKey={}",
                urlencoding::encode(&token.next_partition_key)
            ));
            if let Some(row) = &token.next_row_key {
                params.push(format!("NextRowKey={}", urlencoding::encode(row)));
            }
        }

        let mut url = format!("{}/{}()", self.endpoint, self.table_name);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        self.with_sas(url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http_client
            .request(method, url)
            .header("Accept", ACCEPT_NO_METADATA)
            .header("x-ms-version", API_VERSION)
            .header("DataServiceVersion", "3.0;NetFx")
    }

    /// Create the table, treating "already exists" as success
    pub async fn ensure_table(&self) -> Result<(), TableError> {
        let url = self.with_sas(format!("{}/Tables", self.endpoint));

        let response = self
            .request(Method::POST, &url)
            .header("Prefer", "return-no-content")
            .json(&serde_json::json!({ "TableName": self.table_name }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!(table = %self.table_name, "Created table");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(table = %self.table_name, "Table already exists");
                Ok(())
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, key: &str, f: F) -> Result<T, TableError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TableError>>,
    {
        let backoff_ms = [500u64, 1000, 2000];
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => {
                    self.health.store(HEALTH_HEALTHY, Ordering::Relaxed);
                    return Ok(result);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt == MAX_RETRIES {
                        match &e {
                            TableError::Network(_) | TableError::Timeout => {
                                self.health.store(HEALTH_UNHEALTHY, Ordering::Relaxed)
                            }
                            TableError::RateLimited | TableError::Server(_, _) => {
                                self.health.store(HEALTH_DEGRADED, Ordering::Relaxed)
                            }
                            _ => {}
                        }
                        self.log_error(operation, key, &e.to_string());
                        return Err(e);
                    }

                    let delay = backoff_ms.get(attempt as usize).copied().unwrap_or(2000);
                    warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        delay_ms = delay,
                        error = %e,
                        "Retrying table operation"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Log an error to the error history ring buffer
    fn log_error(&self, operation: &str, key: &str, error: &str) {
        let entry = ErrorEntry {
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            operation: operation.to_string(),
            key: key.to_string(),
            error: error.to_string(),
        };

        let mut log = self.error_log.write().unwrap_or_else(|e| e.into_inner());
        if log.len() >= MAX_ERROR_HISTORY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Get connection health status string
    pub fn health_status(&self) -> &'static str {
        match self.health.load(Ordering::Relaxed) {
            HEALTH_HEALTHY => "healthy",
            HEALTH_DEGRADED => "degraded",
            _ => "unhealthy",
        }
    }

    /// Get recent errors
    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Read every entity in the table, or in one partition, following
    /// continuation tokens
    pub async fn query_entities(
        &self,
        partition_key: Option<&str>,
    ) -> Result<Vec<PostEntity>, TableError> {
        let key = partition_key.unwrap_or("*");
        let mut all_entities = Vec::new();
        let mut continuation: Option<Continuation> = None;

        loop {
            let url = self.query_url(partition_key, continuation.as_ref());
            let url = url.as_str();
            debug!(partition = key, continuation = ?continuation, "Querying table page");

            let (page, next) = self
                .with_retry("query", key, || async move {
                    let response = self.request(Method::GET, url).send().await?;
                    if !response.status().is_success() {
                        return Err(error_from_response(response).await);
                    }
                    let next = continuation_from_headers(response.headers());
                    let page: QueryResponse = response.json().await?;
                    Ok((page, next))
                })
                .await?;

            all_entities.extend(page.value);

            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        debug!(count = all_entities.len(), "Queried entities from table");
        Ok(all_entities)
    }

    /// Insert the entity or merge it into the existing row
    pub async fn insert_or_merge(&self, entity: &PostEntity) -> Result<(), TableError> {
        let url = self.entity_url(&entity.partition_key, &entity.row_key);
        let url = url.as_str();
        let merge = Method::from_bytes(b"MERGE")
            .map_err(|e| TableError::Request(format!("Invalid HTTP method: {}", e)))?;
        let merge = &merge;

        self.with_retry("insert_or_merge", &entity.row_key, || async move {
            let response = self
                .request(merge.clone(), url)
                .json(entity)
                .send()
                .await?;

            // Only 204 confirms the write
            if response.status() == StatusCode::NO_CONTENT {
                Ok(())
            } else {
                Err(error_from_response(response).await)
            }
        })
        .await?;

        debug!(row = %entity.row_key, "Merged entity into table");
        Ok(())
    }

    /// Delete a row regardless of its current ETag
    pub async fn delete_entity(&self, partition_key: &str, row_key: &str) -> Result<(), TableError> {
        let url = self.entity_url(partition_key, row_key);
        let url = url.as_str();

        self.with_retry("delete", row_key, || async move {
            let response = self
                .request(Method::DELETE, url)
                .header("If-Match", "*")
                .send()
                .await?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(error_from_response(response).await)
            }
        })
        .await?;

        debug!(row = row_key, "Deleted entity from table");
        Ok(())
    }
}

/// Quote a key for use inside `(PartitionKey='..')`
fn encode_key(key: &str) -> String {
    urlencoding::encode(&key.replace('\'', "''")).into_owned()
}

async fn error_from_response(response: Response) -> TableError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    TableError::from_status(status, &body)
}

fn continuation_from_headers(headers: &HeaderMap) -> Option<Continuation> {
    let next_partition_key = headers.get(NEXT_PARTITION_HEADER)?.to_str().ok()?.to_string();
    let next_row_key = headers
        .get(NEXT_ROW_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    Some(Continuation {
        next_partition_key,
        next_row_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn client() -> TableClient {
        TableClient::new("https://acct.table.example.net/", "posts", "?sv=2019&sig=abc").unwrap()
    }

    #[test]
    fn test_entity_url_quotes_keys() {
        let url = client().entity_url("p1", "it's");
        assert_eq!(
            url,
            "https://acct.table.example.net/posts(PartitionKey='p1',RowKey='it%27%27s')?sv=2019&sig=abc"
        );
    }

    #[test]
    fn test_query_url_with_continuation() {
        let c = client();
        let first = c.query_url(None, None);
        assert_eq!(first, "https://acct.table.example.net/posts()?sv=2019&sig=abc");

        let token = Continuation {
            next_partition_key: "1!8!cG9zdHM-".to_string(),
            next_row_key: Some("1!4!YWJj".to_string()),
        };
        let next = c.query_url(None, Some(&token));
        assert!(next.contains("()?NextPartitionKey=1%218%21cG9zdHM-"));
        assert!(next.contains("&NextRowKey=1%214%21YWJj"));
        assert!(next.ends_with("&sv=2019&sig=abc"));
    }

    #[test]
    fn test_query_url_for_one_partition() {
        let url = client().query_url(Some("p'1"), None);
        assert_eq!(
            url,
            "https://acct.table.example.net/posts()?$filter=PartitionKey%20eq%20%27p%27%271%27&sv=2019&sig=abc"
        );
    }

    #[test]
    fn test_continuation_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(continuation_from_headers(&headers).is_none());

        headers.insert(NEXT_PARTITION_HEADER, HeaderValue::from_static("p"));
        let token = continuation_from_headers(&headers).unwrap();
        assert_eq!(token.next_partition_key, "p");
        assert!(token.next_row_key.is_none());

        headers.insert(NEXT_ROW_HEADER, HeaderValue::from_static("r"));
        let token = continuation_from_headers(&headers).unwrap();
        assert_eq!(token.next_row_key.as_deref(), Some("r"));
    }

    #[test]
    fn test_error_log_is_bounded() {
        let c = client();
        for i in 0..(MAX_ERROR_HISTORY + 3) {
            c.log_error("query", &format!("k{}", i), "boom");
        }
        let errors = c.recent_errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        assert_eq!(errors[0].key, "k3");
        assert_eq!(c.health_status(), "healthy");
    }

    #[test]
    fn test_error_entry_display() {
        let entry = ErrorEntry {
            timestamp: 1_700_000_000,
            operation: "delete".to_string(),
            key: "p1".to_string(),
            error: "Not found".to_string(),
        };
        assert_eq!(entry.to_string(), "2023-11-14T22:13:20Z delete p1: Not found");
    }
}
