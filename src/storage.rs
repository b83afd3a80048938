//! Image storage backend selection. Uploads happen outside this service;
//! here the settings are only checked so a misconfigured deployment fails at
//! startup instead of on the first profile picture.

use crate::config::{Config, StorageBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageSettings {
    Local {
        root: String,
    },
    Cloudinary {
        url: String,
    },
    S3 {
        bucket: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
    },
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StorageConfigError {
    #[error("{0} must be set for the selected storage backend")]
    Missing(&'static str),
}

fn required(
    value: &Option<String>,
    name: &'static str,
) -> Result<String, StorageConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(StorageConfigError::Missing(name))
}

impl StorageSettings {
    pub fn from_config(config: &Config) -> Result<Self, StorageConfigError> {
        Self::resolve(
            config.storage_backend,
            &config.media_root,
            &config.cloudinary_url,
            [
                &config.s3_bucket,
                &config.s3_region,
                &config.aws_access_key_id,
                &config.aws_secret_access_key,
            ],
        )
    }

    fn resolve(
        backend: StorageBackend,
        media_root: &str,
        cloudinary_url: &Option<String>,
        [bucket, region, key_id, secret]: [&Option<String>; 4],
    ) -> Result<Self, StorageConfigError> {
        Ok(match backend {
            StorageBackend::Local => StorageSettings::Local {
                root: media_root.to_string(),
            },
            StorageBackend::Cloudinary => StorageSettings::Cloudinary {
                url: required(cloudinary_url, "CLOUDINARY_URL")?,
            },
            StorageBackend::S3 => StorageSettings::S3 {
                bucket: required(bucket, "S3_BUCKET")?,
                region: required(region, "S3_REGION")?,
                access_key_id: required(key_id, "AWS_ACCESS_KEY_ID")?,
                secret_access_key: required(secret, "AWS_SECRET_ACCESS_KEY")?,
            },
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageSettings::Local { .. } => "local",
            StorageSettings::Cloudinary { .. } => "cloudinary",
            StorageSettings::S3 { .. } => "s3",
        }
    }
}
