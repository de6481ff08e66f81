//! Object Registrar: byte-range reads and whole-object writes against the
//! local filesystem or an S3-compatible object store.

mod local;
mod s3;

pub use local::LocalFsRegistrar;
pub use s3::S3Registrar;

use async_trait::async_trait;
use url::Url;

use crate::error::{Error, Result};
use crate::lines::LineReader;
use crate::protocol::FileData;

#[async_trait]
pub trait ObjectRegistrar: Send + Sync {
    /// Opens `file` (optionally a byte range of it) as a line stream.
    async fn get_file(&self, file: &FileData) -> Result<LineReader>;

    async fn write_file(&self, path: &str, content: Vec<u8>) -> Result<()>;

    async fn get_file_size(&self, bucket: &str, key: &str) -> Result<u64>;
}

/// Validated byte range of a [`FileData`]. Ranges are half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    Whole,
    From(u64),
    Span { start: u64, end: u64 },
}

impl ByteRange {
    pub fn of(file: &FileData) -> Result<Self> {
        match (file.split_start, file.split_end) {
            (None, None) => Ok(ByteRange::Whole),
            (Some(start), None) => Ok(ByteRange::From(start)),
            (start, Some(end)) => {
                let start = start.unwrap_or(0);
                if start > end {
                    return Err(Error::failed_precondition(format!(
                        "the split start {start} can't be bigger than the split end {end}"
                    )));
                }
                if start == 0 && end == 0 {
                    return Err(Error::failed_precondition("can't handle empty split"));
                }
                Ok(ByteRange::Span { start, end })
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(*self, ByteRange::Span { start, end } if start == end)
    }

    /// HTTP `Range` header value; `None` reads the whole object.
    pub fn header(&self) -> Option<String> {
        match *self {
            ByteRange::Whole => None,
            ByteRange::From(start) => Some(format!("bytes={start}-")),
            ByteRange::Span { start, end } => Some(format!("bytes={}-{}", start, end.saturating_sub(1))),
        }
    }
}

/// `http(s)://<endpoint>/<bucket>/<key>` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    /// Host, port and any path prefix in front of the bucket.
    pub endpoint: String,
    pub use_ssl: bool,
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::invalid_argument("empty path"));
        }
        let url = Url::parse(path).map_err(|e| Error::invalid_argument(format!("{path}: {e}")))?;
        let use_ssl = match url.scheme() {
            "http" => false,
            "https" => true,
            _ => {
                return Err(Error::invalid_argument(
                    "wrong protocol, please make sure the protocol is either HTTP or HTTPS",
                ))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_argument(format!("{path}: missing host")))?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        if segments.len() < 2 {
            return Err(Error::invalid_argument(format!(
                "{path}: expected <endpoint>/<bucket>/<object>"
            )));
        }
        let (prefix, object) = segments.split_at(segments.len() - 2);
        let mut endpoint = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        for seg in prefix {
            endpoint.push('/');
            endpoint.push_str(seg);
        }
        Ok(Self {
            endpoint,
            use_ssl,
            bucket: object[0].to_string(),
            key: object[1].to_string(),
        })
    }

    pub fn endpoint_url(&self) -> String {
        endpoint_url(&self.endpoint, self.use_ssl)
    }
}

pub fn endpoint_url(endpoint: &str, use_ssl: bool) -> String {
    let scheme = if use_ssl { "https" } else { "http" };
    format!("{scheme}://{endpoint}")
}
