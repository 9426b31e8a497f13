use super::{validate_key, Storage};
use crate::config::S3Config;
use crate::{Error, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::{config::Region, Client as S3Client};

/// Stores images in a pre-existing S3 (or S3-compatible) bucket.
pub struct S3Storage {
    client: S3Client,
    bucket: String,
    base_url: String,
}

impl S3Storage {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        // Explicit keys win over the default provider chain.
        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "imgqueue-config",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            base_url: config.public_base_url(),
        })
    }

    fn get_public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put(&self, name: &str, content: &[u8]) -> Result<String> {
        validate_key(name)?;
        let body = ByteStream::from(content.to_vec());

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(body)
            .content_type(content_type_for(name))
            .send()
            .await
            .map_err(|e| {
                let status = e.raw_response().map(|response| response.status().as_u16());
                let message = format!("Failed to upload {}: {}", name, e);
                if status.is_some_and(is_rejection) {
                    Error::UploadRejected(message)
                } else {
                    Error::Upload(message)
                }
            })?;

        Ok(self.get_public_url(name))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        validate_key(name)?;

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(GetObjectError::NoSuchKey(_)) => Error::NotFound(name.to_string()),
                _ => Error::Transport(format!("Failed to read {}: {}", name, e)),
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read body of {}: {}", name, e)))?;

        Ok(bytes.to_vec())
    }
}

/// Client errors other than timeouts and throttling will fail the same way
/// on every attempt.
fn is_rejection(status: u16) -> bool {
    (400..500).contains(&status) && status != 408 && status != 429
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.jpg"), "image/jpeg");
        assert_eq!(content_type_for("cnv-a.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("cnv-b.png"), "image/png");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn test_is_rejection() {
        assert!(is_rejection(403));
        assert!(is_rejection(404));
        assert!(!is_rejection(408));
        assert!(!is_rejection(429));
        assert!(!is_rejection(500));
        assert!(!is_rejection(503));
    }

    #[tokio::test]
    async fn test_public_url_uses_configured_base() {
        let config = S3Config {
            bucket: "images".to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            public_base_url: Some("https://cdn.example.com/".to_string()),
            access_key_id: Some("key".to_string()),
            secret_access_key: Some("secret".to_string()),
        };

        let storage = S3Storage::new(&config).await.unwrap();
        assert_eq!(
            storage.get_public_url("cmp-a.jpg"),
            "https://cdn.example.com/cmp-a.jpg"
        );
    }
}
