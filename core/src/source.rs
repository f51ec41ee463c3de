//! Record source channel.
//!
//! Delivers opaque payloads from a transport named by a source-spec string:
//!
//! - `-` — stdin, one payload per line (empty line = end of stream)
//! - `file:PATH` — same line framing from a file
//! - `tcp:HOST:PORT` — connect and read length-prefixed payloads: a
//!   big-endian `u16` length followed by the payload; a payload of one byte
//!   or less is the end-of-stream marker
//!
//! Payload decoding (JSON vs the binary wire record) happens upstream in
//! [`crate::flow::FlowRecord::decode`].

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

enum Transport {
    /// Line framing over stdin or a file.
    Lines(tokio::io::Lines<BufReader<BoxedReader>>),
    /// u16 length-prefixed framing over a TCP stream.
    Framed(BufReader<TcpStream>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Lines(_) => f.write_str("Transport::Lines(..)"),
            Transport::Framed(_) => f.write_str("Transport::Framed(..)"),
        }
    }
}

#[derive(Debug)]
pub struct RecordChannel {
    transport: Transport,
}

impl RecordChannel {
    /// Open the transport named by `spec`.
    pub async fn open(spec: &str) -> Result<Self> {
        let transport = if spec == "-" {
            let reader: BoxedReader = Box::new(tokio::io::stdin());
            Transport::Lines(BufReader::new(reader).lines())
        } else if let Some(path) = spec.strip_prefix("file:") {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open source file {path}"))?;
            let reader: BoxedReader = Box::new(file);
            Transport::Lines(BufReader::new(reader).lines())
        } else if let Some(addr) = spec.strip_prefix("tcp:") {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("cannot connect to source {addr}"))?;
            info!(addr, "connected to record source");
            Transport::Framed(BufReader::new(stream))
        } else {
            bail!("unrecognized source spec '{spec}' (expected '-', 'file:PATH' or 'tcp:HOST:PORT')");
        };
        Ok(Self { transport })
    }

    /// Receive one payload. `Ok(None)` is end of stream: either transport
    /// EOF or the explicit end marker (empty line / payload of ≤ 1 byte).
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.transport {
            Transport::Lines(lines) => {
                let line = lines.next_line().await.context("source read failed")?;
                match line {
                    None => Ok(None),
                    Some(line) if line.trim().is_empty() => Ok(None),
                    Some(line) => Ok(Some(line.into_bytes())),
                }
            }
            Transport::Framed(stream) => {
                let mut len_buf = [0u8; 2];
                match stream.read_exact(&mut len_buf).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e).context("source read failed"),
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut payload = vec![0u8; len];
                stream
                    .read_exact(&mut payload)
                    .await
                    .context("source read failed mid-record")?;
                if len <= 1 {
                    return Ok(None);
                }
                Ok(Some(payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("fluxgate-src-{tag}-{}.jsonl", std::process::id()))
    }

    #[tokio::test]
    async fn test_file_source_lines() {
        let path = temp_path("lines");
        std::fs::write(&path, "{\"a\":1}\n{\"b\":2}\n").unwrap();
        let mut channel = RecordChannel::open(&format!("file:{}", path.display()))
            .await
            .expect("file source should open");

        assert_eq!(channel.recv().await.unwrap(), Some(b"{\"a\":1}".to_vec()));
        assert_eq!(channel.recv().await.unwrap(), Some(b"{\"b\":2}".to_vec()));
        assert_eq!(channel.recv().await.unwrap(), None, "EOF ends the stream");
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_empty_line_is_end_of_stream() {
        let path = temp_path("eos");
        std::fs::write(&path, "{\"a\":1}\n\n{\"never\":true}\n").unwrap();
        let mut channel = RecordChannel::open(&format!("file:{}", path.display()))
            .await
            .unwrap();

        assert!(channel.recv().await.unwrap().is_some());
        assert_eq!(
            channel.recv().await.unwrap(),
            None,
            "an empty line terminates the stream"
        );
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_fails_open() {
        let err = RecordChannel::open("file:/nonexistent/fluxgate.jsonl")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fluxgate.jsonl"));
    }

    #[tokio::test]
    async fn test_bad_spec_fails_open() {
        assert!(RecordChannel::open("carrier-pigeon:coop").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_source_length_framing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            for payload in [&b"hello"[..], &b"world!"[..]] {
                peer.write_all(&(payload.len() as u16).to_be_bytes())
                    .await
                    .unwrap();
                peer.write_all(payload).await.unwrap();
            }
            // one-byte payload: explicit end-of-stream marker
            peer.write_all(&1u16.to_be_bytes()).await.unwrap();
            peer.write_all(&[0u8]).await.unwrap();
        });

        let mut channel = RecordChannel::open(&format!("tcp:{addr}")).await.unwrap();
        assert_eq!(channel.recv().await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(channel.recv().await.unwrap(), Some(b"world!".to_vec()));
        assert_eq!(channel.recv().await.unwrap(), None);
    }
}
