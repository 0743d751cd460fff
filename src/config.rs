use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// S3-compatible bucket holding avatar images.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Public root of the API, used to compose avatar URLs.
    pub app_url: String,
    pub host: String,
    pub port: u16,
    /// `AUDIT_LOG=log` sends activities to the tracing output instead of
    /// the `activity_log` table.
    pub audit_to_log: bool,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: env_or("JWT_ISSUER", "accounts"),
            audience: env_or("JWT_AUDIENCE", "accounts-users"),
            ttl_minutes: env_parse_or("JWT_TTL_MINUTES", 60),
            refresh_ttl_minutes: env_parse_or("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 14),
        };
        let storage = StorageConfig {
            endpoint: std::env::var("MINIO_ENDPOINT")?,
            bucket: env_or("MINIO_BUCKET", "avatars"),
            access_key: std::env::var("MINIO_ACCESS_KEY")?,
            secret_key: std::env::var("MINIO_SECRET_KEY")?,
            region: env_or("MINIO_REGION", "us-east-1"),
        };
        Ok(Self {
            database_url,
            app_url: env_or("APP_URL", "http://localhost:8080"),
            host: env_or("APP_HOST", "0.0.0.0"),
            port: env_parse_or("APP_PORT", 8080),
            audit_to_log: env_or("AUDIT_LOG", "database") == "log",
            jwt,
            storage,
        })
    }
}
