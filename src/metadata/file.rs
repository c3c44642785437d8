use std::fmt;
use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::metadata::bencode::{decode_with_spans, BencodeError, BencodeValue, Dictionary};
use crate::metadata::field::{
    convert_string, lossy_string_list, optional_list, optional_lossy_string, optional_string, optional_uint,
    required_bytes, required_dictionary, required_lossy_string, required_uint, string_list, FieldError,
};
use crate::util::sha1_hash;

pub type InfoHash = [u8; 20];

/// A parsed torrent descriptor together with the hash of its raw info dictionary.
#[derive(Debug, Clone)]
pub struct MetaInfo {
    info: TorrentMetadata,
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    creation_date: Option<u64>,
    comment: Option<String>,
    created_by: Option<String>,
    encoding: Option<String>,
    info_hash: InfoHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub piece_length: u64,
    /// Concatenated 20-byte piece digests.
    pub pieces: Vec<u8>,
    pub name: String,
    pub private: bool,
    pub mode: FileMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileMode {
    Single { length: u64, md5sum: Option<String> },
    Multiple { files: Vec<FileEntry> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
    pub md5sum: Option<String>,
}

#[derive(Debug, Error)]
pub enum MetaInfoError {
    #[error("descriptor is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error("descriptor is not a dictionary")]
    FileIsNotDictionary,
    #[error("info dictionary has both 'length' and 'files'")]
    AmbiguousFileMode,
    #[error("info dictionary has neither 'length' nor 'files'")]
    MissingFileMode,
    #[error("pieces byte length ({0}) is not a multiple of 20")]
    InvalidNumberOfPieces(usize),
    #[error("private flag must be 0 or 1 but is {0}")]
    InvalidPrivateValue(u64),
    #[error("key '{0}' maps to an empty list")]
    KeyMapsToAnEmptyList(&'static str),
    #[error("files entry is not a dictionary")]
    InvalidFileEntry,
    #[error("announce-list element is neither a list nor a string")]
    InvalidAnnounceListElement,
    #[error("unable to read descriptor: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, MetaInfoError>;

const ANNOUNCE: &str = "announce";
const ANNOUNCE_LIST: &str = "announce-list";
const CREATION_DATE: &str = "creation date";
const COMMENT: &str = "comment";
const CREATED_BY: &str = "created by";
const ENCODING: &str = "encoding";
const INFO: &str = "info";
const PIECE_LENGTH: &str = "piece length";
const PIECES: &str = "pieces";
const PRIVATE: &str = "private";
const NAME: &str = "name";
const LENGTH: &str = "length";
const MD5SUM: &str = "md5sum";
const FILES: &str = "files";
const PATH: &str = "path";

const ANNOUNCE_PREFIX: &str = "announce";
const SCRAPE_PREFIX: &str = "scrape";

impl MetaInfo {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (value, spans) = decode_with_spans(bytes)?;
        let items = value.as_dictionary().ok_or(MetaInfoError::FileIsNotDictionary)?;
        let info_items = required_dictionary(items, INFO)?;

        // Hash the info dictionary exactly as it was encoded; re-encoding the
        // decoded value may reorder keys and produce a different digest.
        let info_span = spans.get(INFO.as_bytes()).cloned().ok_or(FieldError::MissingRequiredKey(INFO))?;
        let info_hash = sha1_hash(&bytes[info_span]);

        let info = TorrentMetadata::try_from(info_items)?;
        let meta_info = MetaInfo {
            info,
            announce: optional_string(items, ANNOUNCE)?.filter(|url| !url.is_empty()),
            announce_list: extract_announce_list(optional_list(items, ANNOUNCE_LIST)?)?,
            creation_date: optional_uint(items, CREATION_DATE)?,
            comment: optional_lossy_string(items, COMMENT)?,
            created_by: optional_lossy_string(items, CREATED_BY)?,
            encoding: optional_string(items, ENCODING)?,
            info_hash,
        };
        debug!(info_hash = %hex::encode(meta_info.info_hash), name = %meta_info.info.name, "parsed descriptor");
        Ok(meta_info)
    }

    pub fn info(&self) -> &TorrentMetadata {
        &self.info
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn announce(&self) -> Option<&str> {
        self.announce.as_deref()
    }

    pub fn announce_list(&self) -> &[Vec<String>] {
        &self.announce_list
    }

    pub fn creation_date(&self) -> Option<u64> {
        self.creation_date
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    /// The primary tracker followed by every other distinct tracker in
    /// `announce-list`, in first-seen order.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        if let Some(primary) = &self.announce {
            urls.push(primary.clone());
        }
        for url in self.announce_list.iter().flatten() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Scrape endpoints for every tracker following the `announce` naming
    /// convention; the others are skipped.
    pub fn scraper_urls(&self) -> Vec<String> {
        self.tracker_urls()
            .iter()
            .filter_map(|tracker| {
                let scrape = scrape_url(tracker);
                if scrape.is_none() {
                    debug!(%tracker, "tracker does not support scrape convention");
                }
                scrape
            })
            .collect()
    }
}

/// Replaces the `announce` prefix of the last path segment with `scrape`.
pub fn scrape_url(tracker: &str) -> Option<String> {
    let mut url = Url::parse(tracker).ok()?;
    let path = url.path().to_string();
    let (directory, last) = match path.rfind('/') {
        Some(i) => path.split_at(i + 1),
        None => ("", path.as_str()),
    };
    let rest = last.strip_prefix(ANNOUNCE_PREFIX)?;
    url.set_path(&format!("{directory}{SCRAPE_PREFIX}{rest}"));
    Some(url.to_string())
}

fn extract_announce_list(value: Option<&[BencodeValue]>) -> Result<Vec<Vec<String>>> {
    let mut tiers = Vec::new();
    for element in value.unwrap_or_default() {
        let tier = match element {
            BencodeValue::List(urls) => string_list(urls, ANNOUNCE_LIST)?,
            BencodeValue::ByteString(_) => vec![convert_string(element, ANNOUNCE_LIST)?],
            _ => return Err(MetaInfoError::InvalidAnnounceListElement),
        };
        tiers.push(tier);
    }
    Ok(tiers)
}

fn extract_file_entry(value: &BencodeValue) -> Result<FileEntry> {
    let items = value.as_dictionary().ok_or(MetaInfoError::InvalidFileEntry)?;
    let length = required_uint(items, LENGTH)?;
    let path = lossy_string_list(optional_list(items, PATH)?.ok_or(FieldError::MissingRequiredKey(PATH))?, PATH)?;
    if path.is_empty() {
        return Err(MetaInfoError::KeyMapsToAnEmptyList(PATH));
    }
    let md5sum = optional_lossy_string(items, MD5SUM)?;
    Ok(FileEntry { length, path, md5sum })
}

impl TryFrom<&Dictionary> for TorrentMetadata {
    type Error = MetaInfoError;

    fn try_from(items: &Dictionary) -> Result<Self> {
        let piece_length = required_uint(items, PIECE_LENGTH)?;
        let pieces = required_bytes(items, PIECES)?;
        if pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidNumberOfPieces(pieces.len()));
        }
        let private = match optional_uint(items, PRIVATE)? {
            None | Some(0) => false,
            Some(1) => true,
            Some(v) => return Err(MetaInfoError::InvalidPrivateValue(v)),
        };
        let name = required_lossy_string(items, NAME)?;

        let mode = match (optional_uint(items, LENGTH)?, optional_list(items, FILES)?) {
            (Some(_), Some(_)) => return Err(MetaInfoError::AmbiguousFileMode),
            (None, None) => return Err(MetaInfoError::MissingFileMode),
            (Some(length), None) => FileMode::Single { length, md5sum: optional_lossy_string(items, MD5SUM)? },
            (None, Some(elements)) => {
                if elements.is_empty() {
                    return Err(MetaInfoError::KeyMapsToAnEmptyList(FILES));
                }
                let files = elements.iter().map(extract_file_entry).collect::<Result<Vec<_>>>()?;
                FileMode::Multiple { files }
            },
        };

        Ok(TorrentMetadata { piece_length, pieces: pieces.to_vec(), name, private, mode })
    }
}

impl TorrentMetadata {
    /// Top-level length; zero in multi-file mode.
    pub fn length(&self) -> u64 {
        match &self.mode {
            FileMode::Single { length, .. } => *length,
            FileMode::Multiple { .. } => 0,
        }
    }

    /// File entries; empty in single-file mode.
    pub fn files(&self) -> &[FileEntry] {
        match &self.mode {
            FileMode::Single { .. } => &[],
            FileMode::Multiple { files } => files,
        }
    }

    pub fn total_length(&self) -> u64 {
        match &self.mode {
            FileMode::Single { length, .. } => *length,
            FileMode::Multiple { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.chunks_exact(20).nth(index).and_then(|chunk| chunk.try_into().ok())
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FileMode::Single { length, md5sum } => {
                write!(f, "{} bytes", length)?;
                if md5sum.is_some() {
                    write!(f, ", md5 present")?;
                }
                Ok(())
            },
            FileMode::Multiple { files } => {
                let file_list = files
                    .iter()
                    .map(|i| format!("{} ({} bytes)", i.path.join("/"), i.length))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "[{}]", file_list)
            },
        }
    }
}

impl fmt::Display for MetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "info hash: {}", hex::encode(self.info_hash))?;
        writeln!(f, "name: {}", self.info.name)?;
        if let Some(announce) = &self.announce {
            writeln!(f, "announce: {}", announce)?;
        }
        writeln!(f, "announce list: [{}]", self.announce_list
            .iter()
            .map(|v| format!("[{}]", v.join(", ")))
            .collect::<Vec<_>>()
            .join(", "))?;
        if let Some(date) = &self.creation_date {
            writeln!(f, "created: {} seconds since epoch", date)?;
        }
        if let Some(text) = &self.comment {
            writeln!(f, "comment: {}", text)?;
        }
        if let Some(author) = &self.created_by {
            writeln!(f, "created by: {}", author)?;
        }
        if let Some(e) = &self.encoding {
            writeln!(f, "encoding: {}", e)?;
        }
        writeln!(f, "private: {}", self.info.private)?;
        writeln!(f, "size: {} bytes ({} pieces of {} bytes each)",
            self.info.total_length(), self.info.num_pieces(), self.info.piece_length)?;
        writeln!(f, "file(s): {}", self.info.mode)
    }
}
