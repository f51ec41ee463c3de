//! Data-point sinks.
//!
//! [`RecordSink`] ships JSON data-point lists over the same framings the
//! source channel reads (lines over stdout/file, u16 length prefixes over
//! TCP). [`HttpSink`] POSTs batched data-point lists to a collector API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::datapoint::DataPoint;

/// Largest data-point list sent in one HTTP request.
pub const DATAPOINTS_PER_REQUEST: usize = 500;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Framing {
    Lines,
    LengthPrefixed,
}

/// Stream sink for JSON data-point lists.
pub struct RecordSink {
    writer: BoxedWriter,
    framing: Framing,
}

impl RecordSink {
    /// Open the transport named by `spec`: `-` (stdout), `file:PATH`, or
    /// `tcp:HOST:PORT`.
    pub async fn open(spec: &str) -> Result<Self> {
        let (writer, framing): (BoxedWriter, Framing) = if spec == "-" {
            (Box::new(tokio::io::stdout()), Framing::Lines)
        } else if let Some(path) = spec.strip_prefix("file:") {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot create sink file {path}"))?;
            (Box::new(file), Framing::Lines)
        } else if let Some(addr) = spec.strip_prefix("tcp:") {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("cannot connect to sink {addr}"))?;
            (Box::new(stream), Framing::LengthPrefixed)
        } else {
            bail!("unrecognized sink spec '{spec}' (expected '-', 'file:PATH' or 'tcp:HOST:PORT')");
        };
        Ok(Self { writer, framing })
    }

    /// Write one JSON list of data-points as a single framed payload.
    pub async fn send(&mut self, datapoints: &[DataPoint]) -> Result<()> {
        let body = serde_json::to_vec(datapoints).context("datapoint serialization failed")?;
        match self.framing {
            Framing::Lines => {
                self.writer.write_all(&body).await?;
                self.writer.write_all(b"\n").await?;
            }
            Framing::LengthPrefixed => {
                if body.len() > u16::MAX as usize {
                    bail!("datapoint list of {} bytes exceeds the frame limit", body.len());
                }
                self.writer.write_all(&(body.len() as u16).to_be_bytes()).await?;
                self.writer.write_all(&body).await?;
            }
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Write the end-of-stream marker and flush.
    pub async fn close(&mut self) -> Result<()> {
        match self.framing {
            Framing::Lines => self.writer.write_all(b"\n").await?,
            Framing::LengthPrefixed => {
                self.writer.write_all(&0u16.to_be_bytes()).await?;
            }
        }
        self.writer.flush().await?;
        Ok(())
    }
}

/// HTTP sink for the collector's `/datapoints` endpoint.
pub struct HttpSink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Startup connectivity test: `GET <base>/` must answer 200.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("connection test to {url} failed"))?;
        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "connection test to {url} failed, unexpected reply ({status}): {}",
                snippet(&body)
            );
        }
        Ok(())
    }

    /// POST the data-points in batches of [`DATAPOINTS_PER_REQUEST`].
    ///
    /// Failed batches (connection error, timeout, non-200) are logged and
    /// dropped; the next tick brings fresh data, so there is no retry.
    pub async fn post_datapoints(&self, datapoints: &[DataPoint]) {
        if datapoints.is_empty() {
            return;
        }
        let url = format!("{}/datapoints", self.base_url);
        for batch in datapoints.chunks(DATAPOINTS_PER_REQUEST) {
            match self.client.post(&url).json(batch).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    info!(count = batch.len(), "datapoints successfully sent");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(
                        %status,
                        count = batch.len(),
                        "collector rejected datapoint batch, dropping it: {}",
                        snippet(&body)
                    );
                }
                Err(e) => {
                    warn!(count = batch.len(), "datapoint POST failed, dropping batch: {e}");
                }
            }
        }
    }
}

/// First 200 characters of an error body, for log lines.
fn snippet(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
