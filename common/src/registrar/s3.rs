use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials as S3Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{Client, Config};
use tracing::{debug, instrument};

use super::{ByteRange, ObjectLocation, ObjectRegistrar};
use crate::error::{Error, Result};
use crate::lines::LineReader;
use crate::protocol::{Credentials, FileData};

/// Registrar backed by an S3-compatible object store (MinIO in practice).
#[derive(Debug, Clone)]
pub struct S3Registrar {
    client: Client,
    endpoint: String,
}

impl S3Registrar {
    pub fn new(endpoint_url: &str, creds: &Credentials) -> Self {
        let credentials = S3Credentials::new(&creds.username, &creds.password, None, None, "mapreduce");
        let config = Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            endpoint: endpoint_url.to_string(),
        }
    }

    /// Registrar for the store `path` lives in.
    pub fn for_path(path: &str, creds: &Credentials) -> Result<Self> {
        let loc = ObjectLocation::parse(path)?;
        Ok(Self::new(&loc.endpoint_url(), creds))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        if self.client.head_bucket().bucket(bucket).send().await.is_ok() {
            return Ok(());
        }
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                debug!("created bucket {}", bucket);
                Ok(())
            }
            Err(err) => match err.as_service_error() {
                Some(e) if e.is_bucket_already_exists() || e.is_bucket_already_owned_by_you() => Ok(()),
                _ => Err(Error::internal(format!(
                    "create bucket {bucket}: {}",
                    DisplayErrorContext(&err)
                ))),
            },
        }
    }
}

/// Splits `bucket/rest/of/key` at the first separator.
fn split_bucket(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(Error::invalid_argument(format!(
            "{path}: expected <bucket>/<object>"
        ))),
    }
}

#[async_trait]
impl ObjectRegistrar for S3Registrar {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn get_file(&self, file: &FileData) -> Result<LineReader> {
        let loc = ObjectLocation::parse(&file.path)?;
        let range = ByteRange::of(file)?;
        if range.is_empty() {
            return Ok(LineReader::from_bytes(Vec::new()));
        }

        let out = self
            .client
            .get_object()
            .bucket(&loc.bucket)
            .key(&loc.key)
            .set_range(range.header())
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_no_such_key() => {
                    Error::not_found(format!("{}/{}: no such object", loc.bucket, loc.key))
                }
                _ => Error::internal(format!("get {}: {}", file.path, DisplayErrorContext(&err))),
            })?;

        Ok(LineReader::new(out.body.into_async_read()))
    }

    #[instrument(skip(self, content), fields(endpoint = %self.endpoint, bytes = content.len()))]
    async fn write_file(&self, path: &str, content: Vec<u8>) -> Result<()> {
        let (bucket, key) = split_bucket(path)?;
        self.ensure_bucket(bucket).await?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|err| Error::internal(format!("put {path}: {}", DisplayErrorContext(&err))))?;
        Ok(())
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn get_file_size(&self, bucket: &str, key: &str) -> Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(e) if e.is_not_found() => Error::not_found(format!("{bucket}/{key}: no such object")),
                _ => Error::internal(format!("head {bucket}/{key}: {}", DisplayErrorContext(&err))),
            })?;
        let len = head.content_length().unwrap_or(0);
        u64::try_from(len).map_err(|_| Error::internal(format!("{bucket}/{key}: negative size {len}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_splits_at_first_segment() {
        assert_eq!(split_bucket("reducers/j-1/0.json").unwrap(), ("reducers", "j-1/0.json"));
        assert_eq!(split_bucket("/out/x").unwrap(), ("out", "x"));
        assert!(split_bucket("lonely").is_err());
    }

    #[tokio::test]
    async fn registrar_is_bound_to_the_path_endpoint() {
        let creds = Credentials {
            username: "minio".into(),
            password: "minio123".into(),
        };
        let reg = S3Registrar::for_path("http://minio:9000/input/a.txt", &creds).unwrap();
        assert_eq!(reg.endpoint(), "http://minio:9000");
        assert!(S3Registrar::for_path("ftp://minio/input/a.txt", &creds).is_err());
    }
}
