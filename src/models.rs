//! Core data models for the media relay

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of an indexed media file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
    Zip,
}

impl MediaKind {
    /// Classify a path by its extension, case-insensitively
    pub fn from_path(path: &str) -> Option<Self> {
        let file = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = file.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "mp4" | "mkv" | "avi" | "mov" | "wmv" | "webm" | "m4v" => Some(MediaKind::Video),
            "jpg" | "jpeg" | "png" | "webp" | "gif" => Some(MediaKind::Image),
            "zip" => Some(MediaKind::Zip),
            _ => None,
        }
    }
}

/// An indexed media item as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaResource {
    /// Forward-slash separated path, unique within the media root
    pub rel_path: String,
    /// Entry name when the item lives inside an archive
    #[serde(default)]
    pub entry: Option<String>,
    pub kind: MediaKind,
    #[serde(default)]
    pub size: Option<u64>,
    /// Modification time, seconds since the epoch
    #[serde(default)]
    pub mtime: Option<i64>,
}

impl MediaResource {
    /// Locator for the full content of this resource
    pub fn locator(&self) -> MediaLocator {
        match &self.entry {
            Some(entry) => MediaLocator::ArchiveImage {
                rel_path: self.rel_path.clone(),
                entry: entry.clone(),
            },
            None => MediaLocator::Stream {
                rel_path: self.rel_path.clone(),
            },
        }
    }

    /// Locator for a thumbnail of this resource
    pub fn thumbnail_locator(&self, size: u32) -> MediaLocator {
        match &self.entry {
            Some(entry) => MediaLocator::ArchiveThumbnail {
                rel_path: self.rel_path.clone(),
                entry: entry.clone(),
                size,
            },
            None => MediaLocator::Thumbnail {
                rel_path: self.rel_path.clone(),
            },
        }
    }
}

/// Caching class of a relayed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    /// Continuous media, immutable once indexed
    Stream,
    /// Single-shot thumbnails, may be regenerated
    Thumbnail,
    /// Full-size image extracted from an archive
    ArchiveImage,
}

impl ResourceClass {
    pub fn max_age_secs(&self, config: &RelayConfig) -> u64 {
        match self {
            ResourceClass::Stream => config.stream_max_age_secs,
            ResourceClass::Thumbnail => config.thumbnail_max_age_secs,
            ResourceClass::ArchiveImage => config.archive_image_max_age_secs,
        }
    }

    /// Cache-Control header value for this class
    pub fn cache_control(&self, config: &RelayConfig) -> String {
        format!("public, max-age={}", self.max_age_secs(config))
    }
}

/// Downstream routes that resolve to a relayed resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRoute {
    Stream,
    Thumbnail,
    ArchiveImage,
    ArchiveThumbnail,
    PerformerThumbnail(String),
}

/// Identifies one upstream resource the relay can fetch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaLocator {
    Stream { rel_path: String },
    Thumbnail { rel_path: String },
    ArchiveImage { rel_path: String, entry: String },
    ArchiveThumbnail { rel_path: String, entry: String, size: u32 },
    PerformerThumbnail { id: String, size: u32 },
}

impl MediaLocator {
    /// Build a locator from downstream query parameters
    ///
    /// Missing or empty identifying parameters are rejected here, before
    /// anything is sent upstream.
    pub fn from_query(
        route: MediaRoute,
        params: &HashMap<String, String>,
        config: &RelayConfig,
    ) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            params
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| RelayError::missing(name))
        };
        let size = |default: u32| -> Result<u32> {
            match params.get("size").filter(|v| !v.is_empty()) {
                Some(raw) => raw.parse::<u32>().map_err(|_| {
                    RelayError::InvalidRequest(format!("size must be a positive integer, got '{}'", raw))
                }),
                None => Ok(default),
            }
        };

        match route {
            MediaRoute::Stream => Ok(MediaLocator::Stream {
                rel_path: required("rel_path")?,
            }),
            MediaRoute::Thumbnail => Ok(MediaLocator::Thumbnail {
                rel_path: required("rel_path")?,
            }),
            MediaRoute::ArchiveImage => Ok(MediaLocator::ArchiveImage {
                rel_path: required("rel_path")?,
                entry: required("entry")?,
            }),
            MediaRoute::ArchiveThumbnail => Ok(MediaLocator::ArchiveThumbnail {
                rel_path: required("rel_path")?,
                entry: required("entry")?,
                size: size(config.prefetch.archive_thumb_size)?,
            }),
            MediaRoute::PerformerThumbnail(id) => {
                if id.is_empty() {
                    return Err(RelayError::missing("id"));
                }
                Ok(MediaLocator::PerformerThumbnail {
                    id,
                    size: size(config.prefetch.performer_thumb_size)?,
                })
            }
        }
    }

    pub fn class(&self) -> ResourceClass {
        match self {
            MediaLocator::Stream { .. } => ResourceClass::Stream,
            MediaLocator::ArchiveImage { .. } => ResourceClass::ArchiveImage,
            MediaLocator::Thumbnail { .. }
            | MediaLocator::ArchiveThumbnail { .. }
            | MediaLocator::PerformerThumbnail { .. } => ResourceClass::Thumbnail,
        }
    }

    /// Resolve the upstream URL for this locator against the backend base
    pub fn upstream_url(&self, base: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(base)
            .map_err(|e| RelayError::ConfigError(format!("Invalid upstream base '{}': {}", base, e)))?;

        let segments: Vec<&str> = match self {
            MediaLocator::Stream { .. } => vec!["media", "stream"],
            MediaLocator::Thumbnail { .. } => vec!["media", "thumb"],
            MediaLocator::ArchiveImage { .. } => vec!["zip", "image"],
            MediaLocator::ArchiveThumbnail { .. } => vec!["zip", "thumb"],
            MediaLocator::PerformerThumbnail { id, .. } => vec!["performers", id.as_str(), "thumb"],
        };
        url.path_segments_mut()
            .map_err(|_| RelayError::ConfigError(format!("Upstream base '{}' cannot be a base", base)))?
            .pop_if_empty()
            .extend(segments);

        {
            let mut query = url.query_pairs_mut();
            match self {
                MediaLocator::Stream { rel_path } | MediaLocator::Thumbnail { rel_path } => {
                    query.append_pair("rel_path", rel_path);
                }
                MediaLocator::ArchiveImage { rel_path, entry } => {
                    query.append_pair("rel_path", rel_path);
                    query.append_pair("entry", entry);
                }
                MediaLocator::ArchiveThumbnail { rel_path, entry, size } => {
                    query.append_pair("rel_path", rel_path);
                    query.append_pair("entry", entry);
                    query.append_pair("size", &size.to_string());
                }
                MediaLocator::PerformerThumbnail { size, .. } => {
                    query.append_pair("size", &size.to_string());
                }
            }
        }

        Ok(url)
    }
}

/// Represents a byte range from an HTTP Range request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteRange {
    /// `bytes=start-end`, both inclusive
    Bounded { start: u64, end: u64 },
    /// `bytes=start-`
    From { start: u64 },
    /// `bytes=-length`, the final `length` bytes
    Suffix { length: u64 },
}

impl ByteRange {
    /// Parse a ByteRange from an HTTP Range header value
    ///
    /// # Arguments
    /// * `header` - The Range header value (e.g., "bytes=0-1023")
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if parsing succeeds
    /// * `Err(RelayError)` if the header format is invalid
    pub fn from_header(header: &str) -> Result<Self> {
        let header = header.trim();

        let range_part = header.strip_prefix("bytes=").ok_or_else(|| {
            RelayError::ParseError(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        let (start, end) = range_part.split_once('-').ok_or_else(|| {
            RelayError::ParseError(format!(
                "Invalid range format, expected 'start-end', got: {}",
                range_part
            ))
        })?;
        let (start, end) = (start.trim(), end.trim());

        let parse = |value: &str, what: &str| {
            value
                .parse::<u64>()
                .map_err(|e| RelayError::ParseError(format!("Invalid {} value: {}", what, e)))
        };

        match (start.is_empty(), end.is_empty()) {
            (true, true) => Err(RelayError::ParseError(
                "Range must have a start or a suffix length".to_string(),
            )),
            (true, false) => Ok(ByteRange::Suffix {
                length: parse(end, "suffix")?,
            }),
            (false, true) => Ok(ByteRange::From {
                start: parse(start, "start")?,
            }),
            (false, false) => {
                let start = parse(start, "start")?;
                let end = parse(end, "end")?;
                if start > end {
                    return Err(RelayError::InvalidRange(format!(
                        "start ({}) must be <= end ({})",
                        start, end
                    )));
                }
                Ok(ByteRange::Bounded { start, end })
            }
        }
    }

    /// Convert this ByteRange to an HTTP Range header value
    pub fn to_header(&self) -> String {
        match self {
            ByteRange::Bounded { start, end } => format!("bytes={}-{}", start, end),
            ByteRange::From { start } => format!("bytes={}-", start),
            ByteRange::Suffix { length } => format!("bytes=-{}", length),
        }
    }
}

/// A parsed `Content-Range` response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Served range, `None` for the unsatisfied form `bytes */total`
    pub range: Option<(u64, u64)>,
    /// Complete length, `None` when reported as `*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse a header such as `bytes 100-199/1000`
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let rest = value.strip_prefix("bytes ").ok_or_else(|| {
            RelayError::ParseError(format!(
                "Content-Range must start with 'bytes ', got: {}",
                value
            ))
        })?;

        let (range, total) = rest.split_once('/').ok_or_else(|| {
            RelayError::ParseError(format!(
                "Invalid Content-Range format, expected 'start-end/total', got: {}",
                rest
            ))
        })?;

        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| RelayError::ParseError(format!("Invalid Content-Range value '{}': {}", v, e)))
        };

        let total = match total.trim() {
            "*" => None,
            t => Some(parse(t)?),
        };

        let range = match range.trim() {
            "*" => None,
            r => {
                let (start, end) = r.split_once('-').ok_or_else(|| {
                    RelayError::ParseError(format!("Invalid range in Content-Range: {}", r))
                })?;
                Some((parse(start)?, parse(end)?))
            }
        };

        Ok(ContentRange { range, total })
    }

    /// Number of bytes covered by the served range
    pub fn len(&self) -> Option<u64> {
        self.range.map(|(start, end)| end.saturating_sub(start) + 1)
    }
}
