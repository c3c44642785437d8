use std::path::Path;

use thiserror::Error;

pub mod config;
pub mod metadata;
pub mod peer;
mod util;

pub use config::ClientConfig;
pub use metadata::file::{FileEntry, FileMode, InfoHash, MetaInfo, MetaInfoError, TorrentMetadata};
pub use metadata::tracker::{
    AnnounceRequest, AnnounceResponse, Peer, PeerList, ScrapeResponse, ScrapeStats, TrackerClient, TrackerError,
    TrackerEvent, TransferStats,
};
pub use peer::{PeerConnection, PeerError, PeerEvent, PeerId, WireMessage};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    MetaInfo(#[from] MetaInfoError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn parse_torrent<P: AsRef<Path>>(path: P) -> Result<MetaInfo> {
    Ok(MetaInfo::from_path(path)?)
}

/// Sends a `started` announce for a fresh download of `meta_info`.
pub async fn discover_peers(meta_info: &MetaInfo, config: &ClientConfig) -> Result<AnnounceResponse> {
    let client = TrackerClient::new(config)?;
    let stats = TransferStats {
        left: meta_info.info().total_length(),
        event: Some(TrackerEvent::Started),
        ..TransferStats::default()
    };
    Ok(client.announce(meta_info, &stats).await?)
}
