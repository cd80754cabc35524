use crate::core::errors::ConfigError;
use crate::core::types::WorkloadClass;
use crate::middleware::retry::RetryPolicy;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    pub body_limit_mb: usize,
    pub request_timeout: Duration,
}

/// Model host (Replicate-style API) configuration
#[derive(Debug, Clone)]
pub struct ModelHostConfig {
    pub api_token: String,
    pub base_url: String,
    pub poll_interval: Duration,
    pub max_job_duration: Duration,
    /// Ask the host to hold the create call open until the job settles
    pub sync_wait: bool,
    pub http_timeout: Duration,
}

/// Hosted model references, `owner/name` or `owner/name:version`
#[derive(Debug, Clone)]
pub struct ModelsConfig {
    pub background_removal: String,
    /// Face restoration; also the first step of beautify
    pub enhance: String,
    /// Super-resolution used by clarity and beautify
    pub upscale: String,
    pub restyle: String,
    pub relight: String,
    pub storyboard: String,
    pub comic_image: String,
}

/// Per-workload-class pool capacities, fixed at process start
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub light: usize,
    pub heavy: usize,
    pub batch: usize,
}

impl ConcurrencyConfig {
    pub fn capacity(&self, class: WorkloadClass) -> usize {
        match class {
            WorkloadClass::Light => self.light,
            WorkloadClass::Heavy => self.heavy,
            WorkloadClass::Batch => self.batch,
        }
    }
}

/// Retry configuration for upstream calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

/// Result cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

/// Input pre-processing configuration
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Long edge limit applied before inputs are submitted upstream
    pub max_side_px: u32,
    pub output_quality: u8,
}

/// Blob store configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub public_base_url: Option<String>,
    /// Base URL that presigned links are built on (this server's /blobs route)
    pub signed_base_url: String,
    pub signing_secret: String,
    pub presign_ttl: Duration,
}

/// Per-caller request limits on the feature routes
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    /// Requests per caller per route within `window`
    pub max_requests: u32,
    /// Route-specific overrides of `max_requests`, keyed by route path
    pub route_limits: BTreeMap<String, u32>,
}

impl RateLimitConfig {
    pub fn limit_for(&self, route: &str) -> u32 {
        self.route_limits.get(route).copied().unwrap_or(self.max_requests)
    }
}

/// Parse `route=limit` pairs separated by commas; malformed pairs are skipped
fn parse_route_limits(raw: &str) -> BTreeMap<String, u32> {
    raw.split(',')
        .filter_map(|pair| {
            let (route, limit) = pair.split_once('=')?;
            let route = route.trim();
            if route.is_empty() {
                return None;
            }
            Some((route.to_string(), limit.trim().parse().ok()?))
        })
        .collect()
}

/// Bubble rendering configuration
#[derive(Debug, Clone)]
pub struct RenderingConfig {
    pub fonts_dir: PathBuf,
    pub font_family: String,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub model_host: ModelHostConfig,
    pub models: ModelsConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub image: ImageConfig,
    pub storage: StorageConfig,
    pub rendering: RenderingConfig,
    pub rate_limit: RateLimitConfig,
}

/// Parse an environment variable, falling back to `default` when unset or malformed
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let host = env_string("SERVER_HOST", "0.0.0.0");
        let port = env_or("SERVER_PORT", 3000u16);

        Self {
            server: ServerConfig {
                port,
                host,
                log_level,
                body_limit_mb: env_or("BODY_LIMIT_MB", 20),
                request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 180)),
            },
            model_host: ModelHostConfig {
                api_token: env::var("REPLICATE_API_TOKEN").unwrap_or_default(),
                base_url: env_string("REPLICATE_BASE_URL", "https://api.replicate.com/v1"),
                poll_interval: Duration::from_millis(env_or("REPLICATE_POLL_INTERVAL_MS", 1500)),
                max_job_duration: Duration::from_millis(env_or("REPLICATE_MAX_JOB_MS", 120_000)),
                sync_wait: env_or("REPLICATE_SYNC_WAIT", false),
                http_timeout: Duration::from_secs(env_or("HTTP_TIMEOUT_SECS", 60)),
            },
            models: ModelsConfig {
                background_removal: env_string(
                    "BACKGROUND_REMOVAL_MODEL",
                    "851-labs/background-remover:a029dff38972b5fda4ec5d75d7d1cd25aeff621d2cf4946a41055d7db66b80bc",
                ),
                enhance: env_string(
                    "ENHANCE_MODEL",
                    "tencentarc/gfpgan:297a243ce8643961d52f745f9b6c8c1bd96850a51c92be5f43628a0d3e08321a",
                ),
                upscale: env_string("UPSCALE_MODEL", "nightmareai/real-esrgan"),
                restyle: env_string("RESTYLE_MODEL", "black-forest-labs/flux-kontext-dev"),
                relight: env_string(
                    "RELIGHT_MODEL",
                    "zsxkib/ic-light:d41bcb10d8c159868f4cfbd7c6a2ca01484f7d39e4613419d5952c61562f1ba7",
                ),
                storyboard: env_string("STORYBOARD_MODEL", "google/gemini-2.5-flash"),
                comic_image: env_string("COMIC_IMAGE_MODEL", "google/nano-banana"),
            },
            concurrency: ConcurrencyConfig {
                light: env_or("REPLICATE_LIGHT_CONCURRENCY", 8),
                heavy: env_or("REPLICATE_HEAVY_CONCURRENCY", 4),
                batch: env::var("REPLICATE_BATCH_CONCURRENCY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| {
                        // Batch flows hold a slot for minutes; keep a small share of the cores
                        std::cmp::max(num_cpus::get() / 4, 2)
                    }),
            },
            retry: RetryConfig {
                max_attempts: env_or("AI_MAX_ATTEMPTS", 3),
                base_delay: Duration::from_millis(env_or("AI_RETRY_BASE_MS", 800)),
                backoff_factor: env_or("AI_RETRY_FACTOR", 2.0),
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", 300)),
                max_entries: env_or("CACHE_MAX_ENTRIES", 100),
            },
            image: ImageConfig {
                max_side_px: env_or("IMAGE_MAX_SIDE_PX", 2048),
                output_quality: env_or("OUTPUT_QUALITY", 92),
            },
            storage: StorageConfig {
                dir: PathBuf::from(env_string("STORAGE_DIR", ".data/blobs")),
                public_base_url: env::var("STORAGE_PUBLIC_BASE_URL")
                    .ok()
                    .map(|s| s.trim().trim_end_matches('/').to_string())
                    .filter(|s| !s.is_empty()),
                signed_base_url: env_string("STORAGE_SIGNED_BASE_URL", &format!("http://localhost:{}/blobs", port))
                    .trim_end_matches('/')
                    .to_string(),
                signing_secret: env::var("STORAGE_SIGNING_SECRET")
                    .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
                presign_ttl: Duration::from_secs(env_or("PRESIGN_EXPIRES_SECS", 3600)),
            },
            rendering: RenderingConfig {
                fonts_dir: PathBuf::from(env_string("FONTS_DIR", "fonts")),
                font_family: env_string("BUBBLE_FONT_FAMILY", "Noto Sans"),
            },
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(env_or("RATE_LIMIT_WINDOW_SECS", 60)),
                max_requests: env_or("RATE_LIMIT_MAX", 60),
                route_limits: parse_route_limits(&env_string("RATE_LIMIT_ROUTES", "/beautify=30")),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // Every pool needs a positive capacity; capacities never change afterwards
        for class in WorkloadClass::ALL {
            if self.concurrency.capacity(class) == 0 {
                return Err(ConfigError::InvalidPoolCapacity { class: class.as_str() });
            }
        }

        // RetryPolicy::new enforces attempts >= 1 and factor >= 1
        self.retry_policy()?;

        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidCacheSize);
        }

        if self.model_host.poll_interval.is_zero() {
            return Err(ConfigError::InvalidModelHostConfig(
                "poll interval must be > 0".to_string(),
            ));
        }
        if self.model_host.max_job_duration < self.model_host.poll_interval {
            return Err(ConfigError::InvalidModelHostConfig(format!(
                "max job duration ({:?}) is shorter than the poll interval ({:?})",
                self.model_host.max_job_duration, self.model_host.poll_interval
            )));
        }

        if !(256..=8192).contains(&self.image.max_side_px) {
            return Err(ConfigError::InvalidImageConfig(format!(
                "max_side_px must be between 256 and 8192, got {}",
                self.image.max_side_px
            )));
        }
        if !(1..=100).contains(&self.image.output_quality) {
            return Err(ConfigError::InvalidImageConfig(format!(
                "output_quality must be between 1 and 100, got {}",
                self.image.output_quality
            )));
        }

        if self.rate_limit.window.is_zero() || self.rate_limit.max_requests == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "window and max requests must be > 0".to_string(),
            ));
        }
        if let Some((route, _)) = self.rate_limit.route_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::InvalidRateLimit(format!("limit for {} must be > 0", route)));
        }

        if self.storage.signing_secret.len() < 16 {
            return Err(ConfigError::InvalidStorageConfig(
                "signing secret must be at least 16 characters".to_string(),
            ));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry.base_delay,
            self.retry.backoff_factor,
        )
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn has_api_token(&self) -> bool {
        !self.model_host.api_token.is_empty()
    }
}

#[cfg(test)]
impl Config {
    /// Configuration with defaults suited to unit tests (no environment access)
    pub fn for_tests(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                host: "127.0.0.1".to_string(),
                log_level: Level::DEBUG,
                body_limit_mb: 20,
                request_timeout: Duration::from_secs(30),
            },
            model_host: ModelHostConfig {
                api_token: "test-token".to_string(),
                base_url: "http://127.0.0.1:9".to_string(),
                poll_interval: Duration::from_millis(1500),
                max_job_duration: Duration::from_secs(120),
                sync_wait: false,
                http_timeout: Duration::from_secs(5),
            },
            models: ModelsConfig {
                background_removal: "acme/bg-remover:v1".to_string(),
                enhance: "acme/restorer:v2".to_string(),
                upscale: "acme/upscaler".to_string(),
                restyle: "acme/stylist".to_string(),
                relight: "acme/relighter:v3".to_string(),
                storyboard: "acme/writer".to_string(),
                comic_image: "acme/painter".to_string(),
            },
            concurrency: ConcurrencyConfig { light: 8, heavy: 4, batch: 2 },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(800),
                backoff_factor: 2.0,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(300),
                max_entries: 100,
            },
            image: ImageConfig {
                max_side_px: 2048,
                output_quality: 92,
            },
            storage: StorageConfig {
                dir: storage_dir.into(),
                public_base_url: None,
                signed_base_url: "http://localhost:3000/blobs".to_string(),
                signing_secret: "0123456789abcdef-test-secret".to_string(),
                presign_ttl: Duration::from_secs(3600),
            },
            rendering: RenderingConfig {
                fonts_dir: PathBuf::from("fonts"),
                font_family: "Noto Sans".to_string(),
            },
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(60),
                max_requests: 60,
                route_limits: BTreeMap::from([("/beautify".to_string(), 30)]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::for_tests("/tmp/blobs");
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency.capacity(WorkloadClass::Heavy), 4);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = Config::for_tests("/tmp/blobs");
        config.concurrency.batch = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPoolCapacity { class: "batch" })
        ));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::for_tests("/tmp/blobs");
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRetryPolicy(_))));
    }

    #[test]
    fn test_route_limits() {
        let limits = parse_route_limits("/beautify=30, /restyle = 10,bogus,/x=abc,=5");
        assert_eq!(limits.len(), 2);
        assert_eq!(limits["/restyle"], 10);

        let config = Config::for_tests("/tmp/blobs");
        assert_eq!(config.rate_limit.limit_for("/beautify"), 30);
        assert_eq!(config.rate_limit.limit_for("/enhance"), 60);
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = Config::for_tests("/tmp/blobs");
        config.rate_limit.route_limits.insert("/relight".to_string(), 0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRateLimit(_))));
    }

    #[test]
    fn test_deadline_shorter_than_poll_rejected() {
        let mut config = Config::for_tests("/tmp/blobs");
        config.model_host.max_job_duration = Duration::from_millis(100);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidModelHostConfig(_))
        ));
    }
}
