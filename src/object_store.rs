use anyhow::Result;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::time::Duration;

use crate::config::ObjectStoreConfig;
use crate::Error;

/// An S3-compatible client targeting a MinIO endpoint.
///
/// Grounded on `minio_storage.go`'s operation set (copy-within-bucket,
/// put/get, bulk remove-by-prefix, presigned URLs); `aws-sdk-s3` is used
/// against MinIO's S3-compatible API since no MinIO-native crate exists for
/// Rust.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    pub bucket_name: String,
}

impl ObjectStore {
    pub async fn new(config: &ObjectStoreConfig) -> Result<Self> {
        let creds = Credentials::new(
            &config.root_user,
            &config.root_password,
            None,
            None,
            "camera-hub",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version_latest()
            .endpoint_url(&config.endpoint)
            .credentials_provider(creds)
            .region(Region::new("us-east-1"))
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket_name: config.bucket_name.clone(),
        })
    }

    pub async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("put {key}: {e}")))?;
        Ok(())
    }

    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("get {key}: {e}")))?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::ObjectStore(format!("read body {key}: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    /// Copies one object from `<src_prefix>/<name>` to `<dst_prefix>/<name>`
    /// within the same bucket.
    pub async fn copy_within_bucket(&self, src_prefix: &str, dst_prefix: &str, name: &str) -> Result<()> {
        let src_key = format!("{src_prefix}/{name}");
        let dst_key = format!("{dst_prefix}/{name}");
        let copy_source = format!("{}/{src_key}", self.bucket_name);

        self.client
            .copy_object()
            .bucket(&self.bucket_name)
            .copy_source(copy_source)
            .key(&dst_key)
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("copy {src_key} -> {dst_key}: {e}")))?;
        Ok(())
    }

    /// Lists every key under `prefix` and bulk-deletes them.
    pub async fn remove_objects_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(prefix);
            if let Some(token) = continuation.clone() {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::ObjectStore(format!("list objects under {prefix}: {e}")))?;

            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        if keys.is_empty() {
            return Ok(());
        }

        for chunk in keys.chunks(1000) {
            let objects: Vec<_> = chunk
                .iter()
                .map(|k| {
                    aws_sdk_s3::types::ObjectIdentifier::builder()
                        .key(k)
                        .build()
                        .expect("key is set")
                })
                .collect();

            let delete = aws_sdk_s3::types::Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|e| Error::ObjectStore(format!("build delete batch: {e}")))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket_name)
                .delete(delete)
                .send()
                .await
                .map_err(|e| Error::ObjectStore(format!("bulk delete under {prefix}: {e}")))?;
        }

        Ok(())
    }

    pub async fn presigned_view_url(&self, key: &str, expiry: Duration) -> Result<String> {
        let presign_config = aws_sdk_s3::presigning::PresigningConfig::expires_in(expiry)
            .map_err(|e| Error::ObjectStore(format!("presign config: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| Error::ObjectStore(format!("presign {key}: {e}")))?;

        Ok(presigned.uri().to_string())
    }
}

/// Builds a `<prefix>/<uuid>/<tp>/` object key, matching the layout every
/// evidence artifact is written under.
pub fn evidence_key(prefix: &str, uuid: &uuid::Uuid, tp: &str, basename: &str) -> String {
    format!("{prefix}/{uuid}/{tp}/{basename}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_key_matches_the_documented_layout() {
        let uuid = uuid::Uuid::nil();
        let key = evidence_key("staging", &uuid, "2026-07-30_12-00-00-000000", "clip.mp4");
        assert_eq!(
            key,
            format!("staging/{uuid}/2026-07-30_12-00-00-000000/clip.mp4")
        );
    }
}
