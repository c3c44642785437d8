use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use torrentwire::*;

const LOCAL_ID: PeerId = PeerId::from_bytes(*b"ABCDEFGHIJ0123456789");

/// Answers a single HTTP request with `body` and yields the request line.
async fn serve_once(body: Vec<u8>) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).lines().next().unwrap_or_default().to_string()
    });
    (format!("http://{addr}"), handle)
}

async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/announce")
}

fn descriptor(announce: &str, fallbacks: &[&str]) -> MetaInfo {
    let mut out = format!("d8:announce{}:{}", announce.len(), announce).into_bytes();
    if !fallbacks.is_empty() {
        out.extend_from_slice(b"13:announce-listl");
        for url in fallbacks {
            out.extend(format!("l{}:{}e", url.len(), url).bytes());
        }
        out.push(b'e');
    }
    out.extend_from_slice(b"4:infod6:lengthi1000e4:name4:file12:piece lengthi16384e6:pieces20:");
    out.extend_from_slice(&[0xAB; 20]);
    out.extend_from_slice(b"ee");
    MetaInfo::from_bytes(&out).unwrap()
}

fn percent_encoded(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii_alphanumeric() { (b as char).to_string() } else { format!("%{b:02X}") })
        .collect()
}

fn config() -> ClientConfig {
    ClientConfig::default().with_peer_id(LOCAL_ID)
}

#[tokio::test]
async fn announce_sends_raw_fields_and_decodes_compact_peers() {
    let mut body = b"d8:intervali1800e5:peers12:".to_vec();
    body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0, 80]);
    body.push(b'e');
    let (base, request) = serve_once(body).await;
    let meta_info = descriptor(&format!("{base}/announce"), &[]);

    let response = discover_peers(&meta_info, &config()).await.unwrap();
    assert_eq!(response.interval, 1800);
    assert!(response.peers.is_compact());
    assert_eq!(response.peers.peers(), &[Peer::new("127.0.0.1", 6881), Peer::new("10.0.0.2", 80)]);

    let request = request.await.unwrap();
    let expected = format!(
        "GET /announce?info_hash={}&peer_id=ABCDEFGHIJ0123456789&port=6881&uploaded=0&downloaded=0&left=1000&compact=1&event=started ",
        percent_encoded(&meta_info.info_hash())
    );
    assert!(request.starts_with(&expected), "unexpected request line {request}");
}

#[tokio::test]
async fn announce_decodes_dictionary_peers() {
    let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.17:peer id20:remote-peer-id-000014:porti6881eeee".to_vec();
    let (base, _request) = serve_once(body).await;
    let meta_info = descriptor(&format!("{base}/announce"), &[]);

    let client = TrackerClient::new(&config()).unwrap();
    let response = client.announce(&meta_info, &TransferStats::default()).await.unwrap();
    assert!(!response.peers.is_compact());
    let peers = response.peers.into_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].addr(), "127.0.0.1:6881");
    assert_eq!(peers[0].peer_id.as_deref(), Some(b"remote-peer-id-00001".as_slice()));
}

#[tokio::test]
async fn failure_reason_is_distinct_from_empty_peer_list() {
    let (base, _request) = serve_once(b"d14:failure reason12:not allowed!e".to_vec()).await;
    let meta_info = descriptor(&format!("{base}/announce"), &[]);

    let client = TrackerClient::new(&config()).unwrap();
    match client.announce(&meta_info, &TransferStats::default()).await {
        Err(TrackerError::Failure(reason)) => assert_eq!(reason, "not allowed!"),
        other => panic!("expected tracker failure, got {other:?}"),
    }

    let (base, _request) = serve_once(b"d8:intervali60e5:peers0:e".to_vec()).await;
    let meta_info = descriptor(&format!("{base}/announce"), &[]);
    let response = client.announce(&meta_info, &TransferStats::default()).await.unwrap();
    assert!(response.peers.peers().is_empty());
}

#[tokio::test]
async fn announce_falls_back_to_next_tracker() {
    let primary = unused_url().await;
    let mut body = b"d8:intervali60e5:peers6:".to_vec();
    body.extend_from_slice(&[192, 168, 1, 9, 0x1F, 0x90]);
    body.push(b'e');
    let (base, request) = serve_once(body).await;
    let fallback = format!("{base}/announce");
    let meta_info = descriptor(&primary, &[&primary, &fallback]);
    assert_eq!(meta_info.tracker_urls(), vec![primary.clone(), fallback.clone()]);

    let client = TrackerClient::new(&config()).unwrap();
    let response = client.announce(&meta_info, &TransferStats::default()).await.unwrap();
    assert_eq!(response.peers.peers(), &[Peer::new("192.168.1.9", 8080)]);
    assert!(request.await.unwrap().starts_with("GET /announce?"));
}

#[tokio::test]
async fn scrape_reports_stats_per_info_hash() {
    let meta_info = descriptor("http://unused/announce", &[]);
    let hash = meta_info.info_hash();
    let mut body = b"d5:filesd20:".to_vec();
    body.extend_from_slice(&hash);
    body.extend_from_slice(b"d8:completei5e10:downloadedi10e10:incompletei3eeee");
    let (base, request) = serve_once(body).await;

    let client = TrackerClient::new(&config()).unwrap();
    let response = client.scrape(&format!("{base}/scrape"), &[hash]).await.unwrap();
    let stats = &response.files[&hash];
    assert_eq!((stats.complete, stats.downloaded, stats.incomplete), (5, 10, 3));
    assert_eq!(stats.name, None);

    let expected = format!("GET /scrape?info_hash={} ", percent_encoded(&hash));
    assert!(request.await.unwrap().starts_with(&expected));
}
