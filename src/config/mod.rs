use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Comma-separated list of classifier endpoint URLs; one worker is
    /// started per endpoint.
    pub classifier_urls: String,

    /// S3-compatible bucket holding raw image blobs
    pub blob_bucket: String,

    /// Blob store access key ID (S3-compatible)
    pub blob_access_key: String,

    /// Blob store secret access key
    pub blob_secret_key: String,

    /// Blob store endpoint URL
    pub blob_endpoint: String,

    /// Poll interval for the queue store, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-request timeout for classification calls, in seconds
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,

    /// How many recoveries an item survives before it is marked dead
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// How long a popped item may stay in-flight before the lease sweep
    /// returns it to pending, in seconds
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Bind address for the Prometheus metrics exporter
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_classify_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> i32 {
    5
}

fn default_visibility_timeout_secs() -> u64 {
    120
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Classifier endpoints parsed out of the comma-separated env var.
    pub fn classifier_endpoints(&self) -> Vec<String> {
        self.classifier_urls
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
