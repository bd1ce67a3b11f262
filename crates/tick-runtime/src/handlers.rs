use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use tick_core::alert::AlertEvent;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Delivery failure, split into retryable and authoritative rejects.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct HandlerError {
    /// Permanent failures are not retried; the event is dropped and
    /// counted.
    pub permanent: bool,
    #[source]
    pub source: anyhow::Error,
}

impl HandlerError {
    pub fn transient(source: anyhow::Error) -> HandlerError {
        HandlerError {
            permanent: false,
            source,
        }
    }

    pub fn permanent(source: anyhow::Error) -> HandlerError {
        HandlerError {
            permanent: true,
            source,
        }
    }
}

/// Terminal consumer of events. Implementations must be idempotent under
/// redelivery within the retry budget.
#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn handle(&self, event: &AlertEvent) -> Result<(), HandlerError>;
}

/// Build a handler from its kind and options. Relative log paths resolve
/// against `base_dir`.
pub fn build_handler(
    kind: &str,
    options: &serde_json::Value,
    base_dir: &Path,
) -> anyhow::Result<Arc<dyn Handler>> {
    let target = |key: &str| -> anyhow::Result<String> {
        options
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("{kind} handler requires option {key:?}"))
    };
    Ok(match kind {
        "log" => {
            let path = PathBuf::from(target("path")?);
            let path = if path.is_relative() {
                base_dir.join(path)
            } else {
                path
            };
            Arc::new(LogHandler { path })
        }
        "post" => Arc::new(PostHandler {
            url: target("url")?,
            client: reqwest::Client::new(),
        }),
        "tcp" => Arc::new(TcpHandler {
            address: target("address")?,
        }),
        other => anyhow::bail!("unknown handler kind {other:?}"),
    })
}

// ---------------------------------------------------------------------------
// log — append events as JSON lines
// ---------------------------------------------------------------------------

pub struct LogHandler {
    path: PathBuf,
}

#[async_trait]
impl Handler for LogHandler {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn handle(&self, event: &AlertEvent) -> Result<(), HandlerError> {
        let line = serde_json::to_string(event)
            .map_err(|e| HandlerError::permanent(e.into()))?;
        let write = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("open {}", self.path.display()))?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
            anyhow::Ok(())
        };
        write.await.map_err(HandlerError::transient)
    }
}

// ---------------------------------------------------------------------------
// post — HTTP POST of the event JSON
// ---------------------------------------------------------------------------

pub struct PostHandler {
    url: String,
    client: reqwest::Client,
}

#[async_trait]
impl Handler for PostHandler {
    fn kind(&self) -> &'static str {
        "post"
    }

    async fn handle(&self, event: &AlertEvent) -> Result<(), HandlerError> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| HandlerError::transient(e.into()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            // An authoritative reject; retrying cannot help.
            Err(HandlerError::permanent(anyhow!(
                "endpoint rejected event: {status}"
            )))
        } else {
            Err(HandlerError::transient(anyhow!(
                "endpoint returned {status}"
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// tcp — one JSON line per event over a fresh connection
// ---------------------------------------------------------------------------

pub struct TcpHandler {
    address: String,
}

#[async_trait]
impl Handler for TcpHandler {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn handle(&self, event: &AlertEvent) -> Result<(), HandlerError> {
        let line = serde_json::to_string(event)
            .map_err(|e| HandlerError::permanent(e.into()))?;
        let write = async {
            let mut stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .with_context(|| format!("connect {}", self.address))?;
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
            anyhow::Ok(())
        };
        write.await.map_err(HandlerError::transient)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tick_core::alert::{EventData, Level};

    fn event() -> AlertEvent {
        AlertEvent {
            topic: "ops".into(),
            id: "cpu".into(),
            message: "cpu is CRITICAL".into(),
            details: String::new(),
            time: Utc::now(),
            level: Level::Critical,
            previous_level: Level::Ok,
            duration: 0,
            recoverable: true,
            data: EventData {
                name: "cpu".into(),
                tags: Default::default(),
                points: vec![],
            },
        }
    }

    #[tokio::test]
    async fn log_handler_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let h = build_handler(
            "log",
            &serde_json::json!({"path": "alerts.log"}),
            dir.path(),
        )
        .unwrap();
        h.handle(&event()).await.unwrap();
        h.handle(&event()).await.unwrap();
        let contents = std::fs::read_to_string(dir.path().join("alerts.log")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: AlertEvent = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.level, Level::Critical);
    }

    #[tokio::test]
    async fn tcp_handler_writes_event_line() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut sock, &mut buf)
                .await
                .unwrap();
            buf
        });

        let h = build_handler(
            "tcp",
            &serde_json::json!({"address": addr.to_string()}),
            Path::new("."),
        )
        .unwrap();
        h.handle(&event()).await.unwrap();

        let buf = accept.await.unwrap();
        let parsed: AlertEvent = serde_json::from_slice(buf.trim_ascii_end()).unwrap();
        assert_eq!(parsed.id, "cpu");
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!(build_handler("pager", &serde_json::json!({}), Path::new(".")).is_err());
    }

    #[test]
    fn missing_option_rejected() {
        assert!(build_handler("log", &serde_json::json!({}), Path::new(".")).is_err());
    }
}
