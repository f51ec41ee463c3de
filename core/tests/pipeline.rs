//! End-to-end pipeline tests.
//!
//! Each test runs a REAL pipeline: the activity and aggregator runners are
//! driven over file channels, and the HTTP sink talks to an actual TCP
//! listener answering canned HTTP responses on a random port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use fluxgate_core::activity::{self, ActivityConfig};
use fluxgate_core::datapoint::DataPoint;
use fluxgate_core::filter::NetworkFilter;
use fluxgate_core::shutdown::StopFlag;
use fluxgate_core::sink::{HttpSink, RecordSink};
use fluxgate_core::source::RecordChannel;
use fluxgate_core::{aggregate, openports};

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("fluxgate-e2e-{tag}-{}.jsonl", std::process::id()))
}

fn read_datapoint_lines(path: &PathBuf) -> Vec<Vec<DataPoint>> {
    let contents = std::fs::read_to_string(path).expect("sink file readable");
    contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).expect("every line is a datapoint list"))
        .collect()
}

// ── Activity pipeline ───────────────────────────────────────────────

#[tokio::test]
async fn test_activity_pipeline_end_to_end() {
    let input = temp_path("act-in");
    let output = temp_path("act-out");

    // Slot 1200: one biflow (the single-slot scenario). A much later flow
    // forces retirement through the queue; end-of-stream flushes the rest.
    let records = [
        json!({
            "src_ip": "10.0.0.1", "dst_ip": "10.0.0.2",
            "src_port": 12345, "dst_port": 22, "protocol": 6,
            "bytes": 500, "packets": 10, "bytes_rev": 4000, "packets_rev": 8,
            "tcp_flags": 18,
            "time_first": "1970-01-01T00:20:00Z", "time_last": "1970-01-01T00:20:01Z"
        }),
        json!({
            "src_ip": "10.0.0.3", "dst_ip": "10.0.0.4",
            "src_port": 1, "dst_port": 2, "protocol": 17,
            "bytes": 100, "packets": 1,
            "time_first": "1970-01-01T00:25:00Z", "time_last": "1970-01-01T00:25:01Z"
        }),
    ];
    let body: String = records.iter().map(|r| format!("{r}\n")).collect();
    std::fs::write(&input, body).unwrap();

    let source = RecordChannel::open(&format!("file:{}", input.display()))
        .await
        .unwrap();
    let sink = RecordSink::open(&format!("file:{}", output.display()))
        .await
        .unwrap();
    let config = ActivityConfig {
        interval: 60,
        maxage: 120,
        src_tag: "itest".to_string(),
    };
    activity::run(source, sink, NetworkFilter::allow_all(), config, StopFlag::new())
        .await
        .expect("pipeline should finish cleanly");

    let lines = read_datapoint_lines(&output);
    std::fs::remove_file(&input).ok();
    std::fs::remove_file(&output).ok();

    // one datapoint per line, grouped in ascending slot order
    let mut slot_starts = Vec::new();
    let mut by_ip: HashMap<String, DataPoint> = HashMap::new();
    for line in &lines {
        assert_eq!(line.len(), 1, "activity emits single-datapoint lists");
        let dp = &line[0];
        assert_eq!(dp.kind, "ip");
        assert_eq!(dp.attr, "activity");
        assert_eq!(dp.src, "itest");
        assert_eq!((dp.t2 - dp.t1).num_seconds(), 60);
        slot_starts.push(dp.t1.timestamp());
        by_ip.insert(dp.id.clone(), dp.clone());
    }
    let mut sorted = slot_starts.clone();
    sorted.sort_unstable();
    assert_eq!(slot_starts, sorted, "slots must be emitted in ascending order");

    let server = &by_ip["10.0.0.2"];
    assert_eq!(server.t1, Utc.timestamp_opt(1200, 0).unwrap());
    assert_eq!(server.v["in_bytes"], json!([500.0]));
    assert_eq!(server.v["in_packets"], json!([10.0]));
    assert_eq!(server.v["in_flows"], json!([1.0]));
    assert_eq!(server.v["out_bytes"], json!([4000.0]));
    assert_eq!(server.v["out_packets"], json!([8.0]));
    assert_eq!(server.v["out_flows"], json!([1.0]));

    let client = &by_ip["10.0.0.1"];
    assert_eq!(client.v["out_bytes"], json!([500.0]));
    assert_eq!(client.v["in_bytes"], json!([4000.0]));
}

// ── Aggregator pipeline ─────────────────────────────────────────────

#[tokio::test]
async fn test_aggregator_pipeline_merges_duplicates() {
    let input = temp_path("agg-in");
    let output = temp_path("agg-out");

    // the same datapoint from two module instances, in two input messages
    let line1 = json!([{
        "type": "ip", "id": "10.0.0.1", "attr": "hostname", "v": "host-a",
        "t1": "2024-05-01T10:00:00", "t2": "2024-05-01T10:10:00", "src": "probe-1"
    }]);
    let line2 = json!([{
        "type": "ip", "id": "10.0.0.1", "attr": "hostname", "v": "host-a",
        "t1": "2024-05-01T09:55:00", "t2": "2024-05-01T10:05:00", "src": "probe-2"
    }, {
        "type": "ip", "id": "10.0.0.2", "attr": "hostname", "v": "host-b",
        "t1": "2024-05-01T10:00:00", "t2": "2024-05-01T10:10:00", "src": "probe-1"
    }]);
    std::fs::write(&input, format!("{line1}\n{line2}\n")).unwrap();

    let source = RecordChannel::open(&format!("file:{}", input.display()))
        .await
        .unwrap();
    let sink = RecordSink::open(&format!("file:{}", output.display()))
        .await
        .unwrap();
    aggregate::run(source, sink, 900, StopFlag::new())
        .await
        .expect("aggregator should finish cleanly");

    let lines = read_datapoint_lines(&output);
    std::fs::remove_file(&input).ok();
    std::fs::remove_file(&output).ok();

    let mut by_id: HashMap<String, DataPoint> = HashMap::new();
    for line in lines {
        by_id.insert(line[0].id.clone(), line[0].clone());
    }
    assert_eq!(by_id.len(), 2, "duplicates merged, distinct entities kept");

    let merged = &by_id["10.0.0.1"];
    assert_eq!(merged.src, "probe-1,probe-2", "source tags form a union");
    assert_eq!(merged.c, Some(1.0));
    assert_eq!(merged.t1, Utc.with_ymd_and_hms(2024, 5, 1, 9, 55, 0).unwrap());
    assert_eq!(merged.t2, Utc.with_ymd_and_hms(2024, 5, 1, 10, 10, 0).unwrap());
}

// ── HTTP sink against a canned responder ────────────────────────────

/// Minimal HTTP/1.1 responder: answers every request with `status` and an
/// empty body, records the element count of every POSTed JSON list.
async fn spawn_http_responder(status: &'static str) -> (SocketAddr, Arc<Mutex<Vec<usize>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let batches = Arc::new(Mutex::new(Vec::new()));
    let recorded = batches.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut peer, _)) = listener.accept().await else {
                break;
            };
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let (reader, mut writer) = peer.split();
                let mut reader = BufReader::new(reader);

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                    return;
                }
                let mut content_length = 0usize;
                loop {
                    let mut header = String::new();
                    if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                        return;
                    }
                    if header.trim().is_empty() {
                        break;
                    }
                    let lower = header.to_ascii_lowercase();
                    if let Some(value) = lower.strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
                let mut body = vec![0u8; content_length];
                if content_length > 0 && reader.read_exact(&mut body).await.is_err() {
                    return;
                }
                if request_line.starts_with("POST") {
                    if let Ok(list) = serde_json::from_slice::<Vec<serde_json::Value>>(&body) {
                        recorded.lock().unwrap().push(list.len());
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                writer.write_all(response.as_bytes()).await.ok();
            });
        }
    });

    (addr, batches)
}

fn port_datapoint(i: usize) -> DataPoint {
    DataPoint {
        kind: "ip".to_string(),
        id: format!("10.0.{}.{}", i / 256, i % 256),
        attr: "open_ports".to_string(),
        v: json!(22),
        t1: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        t2: Utc.timestamp_opt(1_700_000_060, 0).unwrap(),
        c: None,
        src: "e2e".to_string(),
    }
}

#[tokio::test]
async fn test_http_sink_health_check_and_batching() {
    let (addr, batches) = spawn_http_responder("200 OK").await;
    let sink = HttpSink::new(&format!("http://{addr}/")).unwrap();

    sink.health_check().await.expect("health check against 200 should pass");

    let datapoints: Vec<DataPoint> = (0..1200).map(port_datapoint).collect();
    sink.post_datapoints(&datapoints).await;

    let sizes = batches.lock().unwrap().clone();
    assert_eq!(sizes, vec![500, 500, 200], "batches are capped at 500 datapoints");
}

#[tokio::test]
async fn test_http_sink_health_check_rejects_non_200() {
    let (addr, _) = spawn_http_responder("503 Service Unavailable").await;
    let sink = HttpSink::new(&format!("http://{addr}")).unwrap();
    let err = sink.health_check().await.unwrap_err();
    assert!(err.to_string().contains("503"), "error should carry the status: {err}");
}

#[tokio::test]
async fn test_http_sink_drops_rejected_batches_without_error() {
    let (addr, batches) = spawn_http_responder("500 Internal Server Error").await;
    let sink = HttpSink::new(&format!("http://{addr}")).unwrap();

    // rejected batches are logged and dropped; the call itself never fails
    let datapoints: Vec<DataPoint> = (0..10).map(port_datapoint).collect();
    sink.post_datapoints(&datapoints).await;
    assert_eq!(batches.lock().unwrap().len(), 1, "the responder still saw the POST");
}

// ── Open-ports pipeline over a file source ──────────────────────────

#[tokio::test]
async fn test_openports_pipeline_uniflow_pairing() {
    let input = temp_path("op-in");

    // two uniflows of one SSH connection, then an unpaired scan
    let records = [
        json!({
            "src_ip": "10.0.0.1", "dst_ip": "10.0.0.2",
            "src_port": 40000, "dst_port": 22, "protocol": 6,
            "bytes": 200, "packets": 4, "tcp_flags": 2,
            "time_first": "2024-05-01T10:00:00Z", "time_last": "2024-05-01T10:00:05Z"
        }),
        json!({
            "src_ip": "10.0.0.2", "dst_ip": "10.0.0.1",
            "src_port": 22, "dst_port": 40000, "protocol": 6,
            "bytes": 300, "packets": 5, "tcp_flags": 18,
            "time_first": "2024-05-01T10:00:01Z", "time_last": "2024-05-01T10:00:06Z"
        }),
        json!({
            "src_ip": "10.0.0.9", "dst_ip": "10.0.0.2",
            "src_port": 50000, "dst_port": 23, "protocol": 6,
            "bytes": 60, "packets": 1, "tcp_flags": 2,
            "time_first": "2024-05-01T10:00:02Z", "time_last": "2024-05-01T10:00:02Z"
        }),
    ];
    let body: String = records.iter().map(|r| format!("{r}\n")).collect();
    std::fs::write(&input, body).unwrap();

    let (addr, batches) = spawn_http_responder("200 OK").await;
    let sink = openports::PortSink::Http(HttpSink::new(&format!("http://{addr}")).unwrap());
    let source = RecordChannel::open(&format!("file:{}", input.display()))
        .await
        .unwrap();
    let config = openports::OpenPortsConfig {
        send_interval: 3600, // far away: the final drain does the sending
        cache_rotation: 3600,
        udp_too: false,
        port_sanity_filter: true,
        src_tag: "op-e2e".to_string(),
    };
    openports::run(
        source,
        sink,
        Arc::new(NetworkFilter::allow_all()),
        config,
        StopFlag::new(),
    )
    .await
    .expect("open-ports pipeline should finish cleanly");
    std::fs::remove_file(&input).ok();

    let sizes = batches.lock().unwrap().clone();
    assert_eq!(
        sizes,
        vec![1],
        "exactly the paired handshake becomes an open port; the lone SYN does not"
    );
}
