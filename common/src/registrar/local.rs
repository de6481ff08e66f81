use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::debug;

use super::{ByteRange, ObjectRegistrar};
use crate::error::{Error, Result};
use crate::lines::LineReader;
use crate::protocol::FileData;

/// Registrar over the local filesystem (shared intermediate volume).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFsRegistrar;

fn io_error(path: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::not_found(format!("{path}: no such file"))
    } else {
        Error::internal(format!("{path}: {e}"))
    }
}

#[async_trait]
impl ObjectRegistrar for LocalFsRegistrar {
    async fn get_file(&self, file: &FileData) -> Result<LineReader> {
        if file.path.is_empty() {
            return Err(Error::invalid_argument("empty path"));
        }
        let range = ByteRange::of(file)?;
        let mut f = fs::File::open(&file.path)
            .await
            .map_err(|e| io_error(&file.path, e))?;

        match range {
            ByteRange::Whole => Ok(LineReader::new(BufReader::new(f))),
            ByteRange::From(start) => {
                f.seek(SeekFrom::Start(start)).await?;
                Ok(LineReader::new(BufReader::new(f)))
            }
            ByteRange::Span { start, end } if start == end => Ok(LineReader::from_bytes(Vec::new())),
            ByteRange::Span { start, end } => {
                f.seek(SeekFrom::Start(start)).await?;
                Ok(LineReader::new(BufReader::new(f.take(end - start))))
            }
        }
    }

    async fn write_file(&self, path: &str, content: Vec<u8>) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content).await.map_err(|e| io_error(path, e))?;
        debug!("wrote {}", path);
        Ok(())
    }

    async fn get_file_size(&self, bucket: &str, key: &str) -> Result<u64> {
        let path = Path::new(bucket).join(key);
        let display = path.display().to_string();
        let meta = fs::metadata(&path).await.map_err(|e| io_error(&display, e))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    fn temp_dir(sub: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("registrar_test_{}_{}", sub, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn lines_of(mut r: LineReader) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(l) = r.next_line().await.unwrap() {
            out.push(l.text());
        }
        out
    }

    #[tokio::test]
    async fn reads_half_open_ranges() {
        let dir = temp_dir("range");
        let path = dir.join("in.txt").to_string_lossy().to_string();
        std::fs::write(&path, "abc\ndef\nghi\n").unwrap();
        let reg = LocalFsRegistrar;

        let r = reg.get_file(&FileData::range(path.as_str(), 4, 8)).await.unwrap();
        assert_eq!(lines_of(r).await, vec!["def"]);

        let r = reg.get_file(&FileData::range(path.as_str(), 2, 6)).await.unwrap();
        assert_eq!(lines_of(r).await, vec!["c", "de"]);

        let r = reg.get_file(&FileData::whole(path.as_str())).await.unwrap();
        assert_eq!(lines_of(r).await.len(), 3);

        let mut r = reg.get_file(&FileData::range(path.as_str(), 5, 5)).await.unwrap();
        assert!(r.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = temp_dir("missing");
        let path = dir.join("nope.json").to_string_lossy().to_string();
        let err = LocalFsRegistrar.get_file(&FileData::whole(path)).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn write_creates_parents_and_size_matches() {
        let dir = temp_dir("write");
        let path = dir.join("job/0.json");
        LocalFsRegistrar
            .write_file(&path.to_string_lossy(), b"{\"pairs\":[]}".to_vec())
            .await
            .unwrap();
        let size = LocalFsRegistrar
            .get_file_size(&dir.to_string_lossy(), "job/0.json")
            .await
            .unwrap();
        assert_eq!(size, 12);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected_before_io() {
        let err = LocalFsRegistrar
            .get_file(&FileData::range("/does/not/matter", 9, 3))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }
}
