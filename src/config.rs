use envconfig::Envconfig;
use std::{str::FromStr, time::Duration};

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "DATABASE_URL")]
    pub db_url: String,
    #[envconfig(from = "PORT", default = "8080")]
    pub port: u16,
    #[envconfig(from = "JWT_SECRET")]
    pub jwt_secret: String,
    #[envconfig(from = "ACCESS_TOKEN_TTL_SECS", default = "900")]
    pub access_token_ttl_secs: u64,
    #[envconfig(from = "REFRESH_TOKEN_TTL_SECS", default = "604800")]
    pub refresh_token_ttl_secs: u64,
    #[envconfig(from = "SESSION_TTL_SECS", default = "1209600")]
    pub session_ttl_secs: u64,
    #[envconfig(from = "STORAGE_BACKEND", default = "local")]
    pub storage_backend: StorageBackend,
    #[envconfig(from = "MEDIA_ROOT", default = "media")]
    pub media_root: String,
    #[envconfig(from = "CLOUDINARY_URL")]
    pub cloudinary_url: Option<String>,
    #[envconfig(from = "S3_BUCKET")]
    pub s3_bucket: Option<String>,
    #[envconfig(from = "S3_REGION")]
    pub s3_region: Option<String>,
    #[envconfig(from = "AWS_ACCESS_KEY_ID")]
    pub aws_access_key_id: Option<String>,
    #[envconfig(from = "AWS_SECRET_ACCESS_KEY")]
    pub aws_secret_access_key: Option<String>,
    #[envconfig(from = "EMAIL_USERNAME")]
    pub email_username: Option<String>,
    #[envconfig(from = "EMAIL_PASSWORD")]
    pub email_password: Option<String>,
    #[envconfig(from = "SMTP_RELAY", default = "smtp.gmail.com")]
    pub smtp_relay: String,
    #[envconfig(from = "FRONTEND_HOST", default = "http://localhost:3000")]
    pub frontend_host: String,
    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: bool,
    #[envconfig(from = "ALLOWED_HOSTS", default = "*")]
    pub allowed_hosts: AllowedHosts,
}

impl Config {
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_token_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn default_log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Cloudinary,
    S3,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "cloudinary" => Ok(StorageBackend::Cloudinary),
            "s3" => Ok(StorageBackend::S3),
            other => Err(format!("unknown storage backend `{other}`")),
        }
    }
}

/// CORS origins. `*` allows any origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedHosts {
    Any,
    List(Vec<String>),
}

impl FromStr for AllowedHosts {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hosts: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err("ALLOWED_HOSTS must not be empty".to_string());
        }
        if hosts.iter().any(|host| host == "*") {
            Ok(AllowedHosts::Any)
        } else {
            Ok(AllowedHosts::List(hosts))
        }
    }
}
