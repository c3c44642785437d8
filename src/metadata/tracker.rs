use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::metadata::bencode::{decode, BencodeError, BencodeValue, Dictionary};
use crate::metadata::field::{
    optional_bytes, optional_lossy_string, optional_uint, required_dictionary, required_string, required_uint,
    FieldError,
};
use crate::metadata::file::{InfoHash, MetaInfo};
use crate::peer::PeerId;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker reported failure: {0}")]
    Failure(String),
    #[error("request to tracker failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tracker response is invalid bencode data: {0}")]
    Bencode(#[from] BencodeError),
    #[error("tracker response is malformed: {0}")]
    Field(#[from] FieldError),
    #[error("tracker response is not a bencoded dictionary")]
    ResponseNotADictionary,
    #[error("compact peers byte length ({0}) is not a multiple of 6")]
    IllegalPeersLength(usize),
    #[error("tracker response missing peers key")]
    MissingPeers,
    #[error("tracker response peers value is neither a byte string nor a list")]
    MalformedPeersList,
    #[error("tracker response peer entry is not a dictionary")]
    MalformedPeerEntry,
    #[error("peer port {0} does not fit in 16 bits")]
    PortOutOfRange(u64),
    #[error("scrape response key of {0} bytes is not an info hash")]
    MalformedScrapeKey(usize),
    #[error("peer address '{0}' has no compact form")]
    NotCompactable(String),
    #[error("invalid tracker url '{0}'")]
    InvalidUrl(String),
    #[error("descriptor lists no trackers")]
    NoTrackers,
}

type Result<T> = std::result::Result<T, TrackerError>;

const FAILURE_REASON: &str = "failure reason";
const WARNING_MESSAGE: &str = "warning message";
const INTERVAL: &str = "interval";
const MIN_INTERVAL: &str = "min interval";
const TRACKER_ID: &str = "tracker id";
const COMPLETE: &str = "complete";
const INCOMPLETE: &str = "incomplete";
const DOWNLOADED: &str = "downloaded";
const PEERS: &str = "peers";
const PEER_ID: &str = "peer id";
const IP: &str = "ip";
const PORT: &str = "port";
const FILES: &str = "files";
const NAME: &str = "name";

const COMPACT_PEER_LENGTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Completed,
    Stopped,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Stopped => "stopped",
        }
    }
}

/// Byte counters and per-announce options supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<TrackerEvent>,
    /// Value of `tracker id` from the previous announce, if the tracker sent one.
    pub tracker_id: Option<Vec<u8>>,
    pub num_want: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub compact: bool,
    pub event: Option<TrackerEvent>,
    pub tracker_id: Option<Vec<u8>>,
    pub num_want: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
enum QueryValue<'a> {
    Raw(&'a [u8]),
    Decimal(u64),
    Text(&'a str),
}

impl QueryValue<'_> {
    fn encode(&self) -> String {
        match self {
            QueryValue::Raw(bytes) => percent_encode(bytes, NON_ALPHANUMERIC).to_string(),
            QueryValue::Decimal(num) => num.to_string(),
            QueryValue::Text(text) => percent_encode(text.as_bytes(), NON_ALPHANUMERIC).to_string(),
        }
    }
}

fn join_query(params: &[(&'static str, QueryValue<'_>)]) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{}={}", name, value.encode()))
        .collect::<Vec<_>>()
        .join("&")
}

fn append_query(base: &str, query: &str) -> Result<Url> {
    let url = Url::parse(base).map_err(|_| TrackerError::InvalidUrl(base.to_string()))?;
    let separator = if url.query().is_some() { '&' } else { '?' };
    let joined = format!("{}{}{}", url, separator, query);
    Url::parse(&joined).map_err(|_| TrackerError::InvalidUrl(joined))
}

impl AnnounceRequest {
    /// Every field maps to exactly one query parameter; the exhaustive
    /// destructuring makes a new field a compile error until it is mapped.
    fn query_parameters(&self) -> Vec<(&'static str, QueryValue<'_>)> {
        let AnnounceRequest {
            info_hash,
            peer_id,
            port,
            uploaded,
            downloaded,
            left,
            compact,
            event,
            tracker_id,
            num_want,
        } = self;

        let mut params = vec![
            ("info_hash", QueryValue::Raw(info_hash)),
            ("peer_id", QueryValue::Raw(peer_id.as_bytes())),
            ("port", QueryValue::Decimal(u64::from(*port))),
            ("uploaded", QueryValue::Decimal(*uploaded)),
            ("downloaded", QueryValue::Decimal(*downloaded)),
            ("left", QueryValue::Decimal(*left)),
            ("compact", QueryValue::Decimal(u64::from(*compact))),
        ];
        if let Some(event) = event {
            params.push(("event", QueryValue::Text(event.as_str())));
        }
        if let Some(id) = tracker_id {
            params.push(("trackerid", QueryValue::Raw(id)));
        }
        if let Some(n) = num_want {
            params.push(("numwant", QueryValue::Decimal(u64::from(*n))));
        }
        params
    }

    pub fn query_string(&self) -> String {
        join_query(&self.query_parameters())
    }

    pub fn url(&self, tracker: &str) -> Result<Url> {
        append_query(tracker, &self.query_string())
    }
}

/// A peer returned by a tracker. Two peers are the same peer when their
/// address and port match, whatever their peer ids.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: Option<Vec<u8>>,
    pub ip: String,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Peer { peer_id: None, ip: ip.into(), port }
    }

    pub fn addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// Peers as the tracker chose to send them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerList {
    Compact(Vec<Peer>),
    Dictionary(Vec<Peer>),
}

impl PeerList {
    pub fn peers(&self) -> &[Peer] {
        match self {
            PeerList::Compact(peers) | PeerList::Dictionary(peers) => peers,
        }
    }

    pub fn into_peers(self) -> Vec<Peer> {
        match self {
            PeerList::Compact(peers) | PeerList::Dictionary(peers) => peers,
        }
    }

    pub fn is_compact(&self) -> bool {
        matches!(self, PeerList::Compact(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub warning_message: Option<String>,
    pub interval: u64,
    pub min_interval: Option<u64>,
    /// Opaque; echo it back unchanged in `TransferStats::tracker_id`.
    pub tracker_id: Option<Vec<u8>>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: PeerList,
}

pub fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>> {
    if bytes.len() % COMPACT_PEER_LENGTH != 0 {
        return Err(TrackerError::IllegalPeersLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_LENGTH)
        .map(|record| {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = u16::from_be_bytes([record[4], record[5]]);
            Peer::new(ip.to_string(), port)
        })
        .collect())
}

pub fn encode_compact_peers(peers: &[Peer]) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(peers.len() * COMPACT_PEER_LENGTH);
    for peer in peers {
        let ip: Ipv4Addr = peer.ip.parse().map_err(|_| TrackerError::NotCompactable(peer.ip.clone()))?;
        bytes.extend_from_slice(&ip.octets());
        bytes.extend_from_slice(&peer.port.to_be_bytes());
    }
    Ok(bytes)
}

fn extract_dictionary_peer(value: &BencodeValue) -> Result<Peer> {
    let items = value.as_dictionary().ok_or(TrackerError::MalformedPeerEntry)?;
    let ip = required_string(items, IP)?;
    let port = required_uint(items, PORT)?;
    let port = u16::try_from(port).map_err(|_| TrackerError::PortOutOfRange(port))?;
    let peer_id = optional_bytes(items, PEER_ID)?.map(<[u8]>::to_vec);
    Ok(Peer { peer_id, ip, port })
}

fn extract_peers(value: Option<&BencodeValue>) -> Result<PeerList> {
    match value {
        Some(BencodeValue::ByteString(bytes)) => Ok(PeerList::Compact(decode_compact_peers(bytes)?)),
        Some(BencodeValue::List(elements)) => {
            let peers = elements.iter().map(extract_dictionary_peer).collect::<Result<Vec<_>>>()?;
            Ok(PeerList::Dictionary(peers))
        },
        Some(_) => Err(TrackerError::MalformedPeersList),
        None => Err(TrackerError::MissingPeers),
    }
}

fn check_failure(items: &Dictionary) -> Result<()> {
    match optional_lossy_string(items, FAILURE_REASON)? {
        Some(reason) => Err(TrackerError::Failure(reason)),
        None => Ok(()),
    }
}

impl TryFrom<&BencodeValue> for AnnounceResponse {
    type Error = TrackerError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(TrackerError::ResponseNotADictionary)?;
        check_failure(items)?;
        Ok(AnnounceResponse {
            warning_message: optional_lossy_string(items, WARNING_MESSAGE)?,
            interval: required_uint(items, INTERVAL)?,
            min_interval: optional_uint(items, MIN_INTERVAL)?,
            tracker_id: optional_bytes(items, TRACKER_ID)?.map(<[u8]>::to_vec),
            complete: optional_uint(items, COMPLETE)?,
            incomplete: optional_uint(items, INCOMPLETE)?,
            peers: extract_peers(items.get(PEERS.as_bytes()))?,
        })
    }
}

impl fmt::Display for AnnounceResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Interval (s): {}", self.interval)?;
        for (i, peer) in self.peers.peers().iter().enumerate() {
            writeln!(f, "{i:03}: {peer}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    pub complete: u64,
    pub downloaded: u64,
    pub incomplete: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub files: HashMap<InfoHash, ScrapeStats>,
}

impl TryFrom<&BencodeValue> for ScrapeResponse {
    type Error = TrackerError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(TrackerError::ResponseNotADictionary)?;
        check_failure(items)?;
        let mut files = HashMap::new();
        for (key, stats) in required_dictionary(items, FILES)? {
            let info_hash: InfoHash = key.as_slice().try_into().map_err(|_| TrackerError::MalformedScrapeKey(key.len()))?;
            let stats = stats.as_dictionary().ok_or(FieldError::KeyDoesNotMapToDictionary(FILES))?;
            files.insert(info_hash, ScrapeStats {
                complete: optional_uint(stats, COMPLETE)?.unwrap_or(0),
                downloaded: optional_uint(stats, DOWNLOADED)?.unwrap_or(0),
                incomplete: optional_uint(stats, INCOMPLETE)?.unwrap_or(0),
                name: optional_lossy_string(stats, NAME)?,
            });
        }
        Ok(ScrapeResponse { files })
    }
}

pub fn scrape_request_url(scrape_url: &str, info_hashes: &[InfoHash]) -> Result<Url> {
    let params: Vec<_> = info_hashes.iter().map(|hash| ("info_hash", QueryValue::Raw(hash))).collect();
    if params.is_empty() {
        return Url::parse(scrape_url).map_err(|_| TrackerError::InvalidUrl(scrape_url.to_string()));
    }
    append_query(scrape_url, &join_query(&params))
}

/// Stateless HTTP tracker client; every announce or scrape is an independent request.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: Client,
    peer_id: PeerId,
    port: u16,
    compact: bool,
}

impl TrackerClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.tracker_timeout).build()?;
        Ok(TrackerClient { client, peer_id: config.peer_id, port: config.port, compact: config.compact })
    }

    pub fn announce_request(&self, info_hash: InfoHash, stats: &TransferStats) -> AnnounceRequest {
        AnnounceRequest {
            info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            compact: self.compact,
            event: stats.event,
            tracker_id: stats.tracker_id.clone(),
            num_want: stats.num_want,
        }
    }

    /// Announces to the descriptor's trackers in order until one answers.
    /// An explicit failure from a tracker ends the walk.
    pub async fn announce(&self, meta_info: &MetaInfo, stats: &TransferStats) -> Result<AnnounceResponse> {
        let request = self.announce_request(meta_info.info_hash(), stats);
        let mut last_error = TrackerError::NoTrackers;
        for tracker in meta_info.tracker_urls() {
            match self.announce_to(&tracker, &request).await {
                Ok(response) => return Ok(response),
                Err(e @ TrackerError::Failure(_)) => return Err(e),
                Err(e) => {
                    warn!(%tracker, error = %e, "announce failed, trying next tracker");
                    last_error = e;
                },
            }
        }
        Err(last_error)
    }

    pub async fn announce_to(&self, tracker: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = request.url(tracker)?;
        debug!(%url, "announcing");
        let value = self.fetch(url).await?;
        let response = AnnounceResponse::try_from(&value)?;
        if let Some(warning) = &response.warning_message {
            warn!(%tracker, %warning, "tracker warning");
        }
        info!(%tracker, peers = response.peers.peers().len(), interval = response.interval, "announce succeeded");
        Ok(response)
    }

    pub async fn scrape(&self, scrape_url: &str, info_hashes: &[InfoHash]) -> Result<ScrapeResponse> {
        let url = scrape_request_url(scrape_url, info_hashes)?;
        debug!(%url, "scraping");
        let value = self.fetch(url).await?;
        ScrapeResponse::try_from(&value)
    }

    async fn fetch(&self, url: Url) -> Result<BencodeValue> {
        let response = self.client.get(url).send().await?;
        let bytes = response.bytes().await?;
        Ok(decode(&bytes)?)
    }
}
