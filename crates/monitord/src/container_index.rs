//! Container ownership index.
//!
//! Maps host PIDs to the container that owns them by asking the container
//! runtime for its per-container process listings. The runtime is a soft
//! dependency: every failure path (daemon not installed, socket
//! unreachable, permission denied, malformed payload) degrades to an
//! empty index for the current poll and is retried from scratch on the
//! next one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use telemetry_types::ContainerInfo;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Transport addresses tried in sequence until one answers the liveness
/// check. Overridable from the CLI.
pub const DEFAULT_ENDPOINTS: &str =
    "unix:///var/run/docker.sock,unix:///run/docker.sock,tcp://127.0.0.1:2375";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Host-PID → owning container for one poll. Rebuilt fresh each pass.
#[derive(Debug, Default, Clone)]
pub struct ContainerOwnershipIndex {
    by_host_pid: HashMap<u32, ContainerInfo>,
}

impl ContainerOwnershipIndex {
    pub fn get(&self, host_pid: u32) -> Option<&ContainerInfo> {
        self.by_host_pid.get(&host_pid)
    }

    pub fn len(&self) -> usize {
        self.by_host_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host_pid.is_empty()
    }

    /// Builds an index from explicit `(pid, container)` entries.
    pub fn from_entries<I: IntoIterator<Item = (u32, ContainerInfo)>>(entries: I) -> Self {
        Self {
            by_host_pid: entries.into_iter().collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("i/o failure talking to the container runtime: {0}")]
    Io(#[from] std::io::Error),
    #[error("container runtime request timed out")]
    Timeout,
    #[error("malformed HTTP response from the container runtime")]
    MalformedResponse,
    #[error("container runtime answered with status {0}")]
    Status(u16),
    #[error("failed to decode container runtime payload: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Parses `unix://...` and `tcp://...` addresses. Other schemes
    /// (e.g. Windows named pipes) are not reachable from this host and
    /// are skipped.
    fn parse(address: &str) -> Option<Self> {
        if let Some(path) = address.strip_prefix("unix://") {
            return Some(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = address.strip_prefix("tcp://") {
            return Some(Endpoint::Tcp(addr.to_string()));
        }
        debug!(address, "skipping unsupported container runtime endpoint");
        None
    }
}

/// Minimal container runtime API client speaking HTTP/1.0 over a local
/// socket or TCP.
pub struct RuntimeClient {
    endpoint: Endpoint,
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
}

impl ContainerSummary {
    /// The runtime reports names with a leading slash.
    fn display_name(&self) -> String {
        self.names
            .first()
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| self.id.chars().take(12).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ContainerTop {
    #[serde(rename = "Titles", default)]
    titles: Vec<String>,
    #[serde(rename = "Processes", default)]
    processes: Vec<Vec<String>>,
}

impl RuntimeClient {
    /// Tries each endpoint in sequence and keeps the first one that
    /// answers the liveness check for the rest of the poll.
    pub async fn connect(endpoints: &[String]) -> Option<Self> {
        for address in endpoints {
            let Some(endpoint) = Endpoint::parse(address) else {
                continue;
            };
            let client = Self { endpoint };
            match client.get("/_ping").await {
                Ok(_) => {
                    debug!(address, "container runtime reachable");
                    return Some(client);
                }
                Err(e) => {
                    debug!(address, error = %e, "container runtime endpoint unreachable");
                }
            }
        }
        None
    }

    /// Sends an HTTP/1.0 GET and returns the response body. HTTP/1.0
    /// keeps the exchange to a single write-then-read-to-eof without
    /// chunked encoding.
    async fn get(&self, path: &str) -> Result<String, RuntimeError> {
        let request = format!("GET {path} HTTP/1.0\r\nHost: localhost\r\n\r\n");

        let exchange = async {
            let mut response = Vec::new();
            match &self.endpoint {
                Endpoint::Unix(socket) => {
                    let mut stream = tokio::net::UnixStream::connect(socket).await?;
                    stream.write_all(request.as_bytes()).await?;
                    stream.shutdown().await?;
                    stream.read_to_end(&mut response).await?;
                }
                Endpoint::Tcp(addr) => {
                    let mut stream = tokio::net::TcpStream::connect(addr).await?;
                    stream.write_all(request.as_bytes()).await?;
                    stream.shutdown().await?;
                    stream.read_to_end(&mut response).await?;
                }
            }
            Ok::<_, RuntimeError>(response)
        };

        let response = tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| RuntimeError::Timeout)??;

        let text = String::from_utf8_lossy(&response);
        let (head, body) = text
            .split_once("\r\n\r\n")
            .ok_or(RuntimeError::MalformedResponse)?;

        let status = parse_status_code(head).ok_or(RuntimeError::MalformedResponse)?;
        if status != 200 {
            return Err(RuntimeError::Status(status));
        }

        Ok(body.to_string())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let body = self.get("/containers/json").await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn container_top(&self, id: &str) -> Result<ContainerTop, RuntimeError> {
        let body = self.get(&format!("/containers/{id}/top")).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn parse_status_code(head: &str) -> Option<u16> {
    // Status line: "HTTP/1.0 200 OK"
    head.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

/// Locates the PID column in a `top` listing. Falls back to column 1,
/// the position used by the default `ps -ef` format.
fn pid_column(titles: &[String]) -> usize {
    titles
        .iter()
        .position(|title| title.eq_ignore_ascii_case("pid"))
        .unwrap_or(1)
}

fn index_from_listings(
    listings: impl IntoIterator<Item = (ContainerInfo, ContainerTop)>,
) -> ContainerOwnershipIndex {
    let mut index = ContainerOwnershipIndex::default();
    for (info, top) in listings {
        let column = pid_column(&top.titles);
        for row in &top.processes {
            let Some(pid) = row.get(column).and_then(|cell| cell.parse::<u32>().ok()) else {
                continue;
            };
            index.by_host_pid.insert(pid, info.clone());
        }
    }
    index
}

/// Builds the host-PID → container index for one poll. Any failure to
/// reach the runtime yields an empty index; failures for an individual
/// container skip that container only.
pub async fn build_index(endpoints: &[String]) -> ContainerOwnershipIndex {
    let Some(client) = RuntimeClient::connect(endpoints).await else {
        debug!("container runtime unreachable, attributing all processes to the host");
        return ContainerOwnershipIndex::default();
    };

    let containers = match client.list_containers().await {
        Ok(containers) => containers,
        Err(e) => {
            debug!(error = %e, "failed to list containers");
            return ContainerOwnershipIndex::default();
        }
    };

    let mut listings = Vec::new();
    for container in containers {
        let info = ContainerInfo {
            name: container.display_name(),
            image: container.image.clone(),
            status: container.state.clone(),
        };
        match client.container_top(&container.id).await {
            Ok(top) => listings.push((info, top)),
            Err(e) => {
                debug!(container = %info.name, error = %e, "failed to list container processes");
            }
        }
    }

    let index = index_from_listings(listings);
    debug!(pids = index.len(), "built container ownership index");
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            image: "test/image:latest".to_string(),
            status: "running".to_string(),
        }
    }

    #[test]
    fn container_summary_strips_leading_slash_from_name() {
        let summary: ContainerSummary = serde_json::from_str(
            r#"{"Id":"abcdef123456","Names":["/trainer"],"Image":"pytorch/pytorch","State":"running"}"#,
        )
        .expect("valid summary payload");
        assert_eq!(summary.display_name(), "trainer");
    }

    #[test]
    fn container_summary_without_names_falls_back_to_short_id() {
        let summary: ContainerSummary =
            serde_json::from_str(r#"{"Id":"abcdef1234567890"}"#).expect("valid summary payload");
        assert_eq!(summary.display_name(), "abcdef123456");
    }

    #[test]
    fn pid_column_prefers_titled_column() {
        let titles = vec!["UID".to_string(), "PPID".to_string(), "PID".to_string()];
        assert_eq!(pid_column(&titles), 2);
    }

    #[test]
    fn pid_column_falls_back_to_second_column() {
        assert_eq!(pid_column(&[]), 1);
    }

    #[test]
    fn index_from_listings_maps_every_listed_pid() {
        let top: ContainerTop = serde_json::from_str(
            r#"{"Titles":["UID","PID","PPID","CMD"],
                "Processes":[["root","4321","1","python"],["root","4322","4321","worker"]]}"#,
        )
        .expect("valid top payload");

        let index = index_from_listings([(info("trainer"), top)]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(4321).map(|c| c.name.as_str()), Some("trainer"));
        assert_eq!(index.get(4322).map(|c| c.name.as_str()), Some("trainer"));
        assert!(index.get(9999).is_none());
    }

    #[test]
    fn index_from_listings_skips_unparsable_rows() {
        let top = ContainerTop {
            titles: vec!["UID".to_string(), "PID".to_string()],
            processes: vec![
                vec!["root".to_string(), "not-a-pid".to_string()],
                vec!["root".to_string()],
                vec!["root".to_string(), "500".to_string()],
            ],
        };

        let index = index_from_listings([(info("trainer"), top)]);
        assert_eq!(index.len(), 1, "only the well-formed row is indexed");
        assert!(index.get(500).is_some());
    }

    #[test]
    fn endpoint_parse_rejects_unknown_schemes() {
        assert!(Endpoint::parse("npipe:////./pipe/docker_engine").is_none());
        assert!(matches!(
            Endpoint::parse("unix:///var/run/docker.sock"),
            Some(Endpoint::Unix(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://127.0.0.1:2375"),
            Some(Endpoint::Tcp(_))
        ));
    }

    #[test]
    fn parse_status_code_reads_the_status_line() {
        assert_eq!(parse_status_code("HTTP/1.0 200 OK\r\nServer: x"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.1 404 Not Found"), Some(404));
        assert_eq!(parse_status_code("garbage"), None);
    }

    #[tokio::test]
    async fn build_index_with_unreachable_endpoints_is_empty() {
        let endpoints = vec![
            "unix:///nonexistent/docker.sock".to_string(),
            "npipe:////./pipe/docker_engine".to_string(),
        ];
        let index = build_index(&endpoints).await;
        assert!(
            index.is_empty(),
            "unreachable runtime must degrade to an empty index"
        );
    }
}
