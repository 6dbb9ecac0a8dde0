use serde::{Deserialize, Serialize};

use crate::adapter::Dialect;

#[cfg(feature = "postgres")]
use anyhow::{Context, Result};
#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;
#[cfg(feature = "postgres")]
use std::time::Duration;
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, NoTls};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Database URL, e.g. `postgresql://user@host:5432/warehouse`. A
    /// `+driver` suffix on the scheme (`postgresql+psycopg2://`) is accepted.
    pub url: String,
    /// Explicit dialect; detected from `url` when absent.
    #[serde(default)]
    pub dialect: Option<Dialect>,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Use with caution.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Maximum pooled connections for the engine.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    4
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dialect: None,
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: default_pool_size(),
        }
    }

    /// Explicit dialect, else whatever the URL names.
    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect.or_else(|| Dialect::from_url(&self.url))
    }

    /// URL with the `+driver` scheme suffix removed.
    pub fn normalized_url(&self) -> String {
        match self.url.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = scheme.split('+').next().unwrap_or(scheme);
                format!("{}://{}", scheme, rest)
            }
            None => self.url.clone(),
        }
    }

    /// URL with any password replaced, safe for logs.
    pub fn display_string(&self) -> String {
        let url = self.normalized_url();
        let Some((scheme, rest)) = url.split_once("://") else {
            return url;
        };
        match rest.split_once('@') {
            Some((userinfo, host)) => {
                let user = userinfo.split(':').next().unwrap_or(userinfo);
                format!("{}://{}@{}", scheme, user, host)
            }
            None => url,
        }
    }

    #[cfg(feature = "postgres")]
    pub fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let mut config: tokio_postgres::Config = self
            .normalized_url()
            .parse()
            .with_context(|| format!("Invalid PostgreSQL URL: {}", self.display_string()))?;

        if config.get_password().is_none() {
            if let Ok(pw) = std::env::var("PGPASSWORD") {
                config.password(pw);
            }
        }

        config.ssl_mode(match self.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        });
        config.connect_timeout(Duration::from_secs(10));
        Ok(config)
    }
}

/// Create a single PostgreSQL client.
/// The connection task is spawned onto the current tokio runtime.
#[cfg(feature = "postgres")]
pub async fn create_client(config: &ConnectionConfig) -> Result<Client> {
    let pg_config = config.pg_config()?;
    let timeout = Duration::from_secs(15);

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) = tokio::time::timeout(timeout, pg_config.connect(NoTls))
                .await
                .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("connection error: {}", e);
                }
            });
            client
        }
        mode => {
            let strict = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) = tokio::time::timeout(timeout, pg_config.connect(tls))
                .await
                .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("connection error: {}", e);
                }
            });
            client
        }
    };

    tracing::info!("connected to {}", config.display_string());
    Ok(client)
}

/// Create a pooled engine; every statement checks a connection out and
/// returns it when done.
#[cfg(feature = "postgres")]
pub fn create_pool(config: &ConnectionConfig) -> Result<deadpool_postgres::Pool> {
    use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};

    let pg_config = config.pg_config()?;
    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = match config.ssl_mode {
        SslMode::Disable => Manager::from_config(pg_config, NoTls, manager_config),
        mode => {
            let strict = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            Manager::from_config(pg_config, tls, manager_config)
        }
    };

    Pool::builder(manager)
        .max_size(config.pool_size.max(1))
        .build()
        .context("Failed to build PostgreSQL connection pool")
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// # Arguments
/// * `config` - Connection configuration
/// * `strict_verify` - If true, always verify certificates (for verify-ca/verify-full modes)
#[cfg(feature = "postgres")]
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else {
        if let Some(ca_path) = &config.ca_cert_path {
            let pem = std::fs::read(ca_path)
                .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
            let cert = native_tls::Certificate::from_pem(&pem)
                .with_context(|| format!("Failed to parse CA certificate: {}", ca_path))?;
            builder.add_root_certificate(cert);
        }
        // verify-ca checks the chain only
        if config.ssl_mode == SslMode::VerifyCa {
            builder.danger_accept_invalid_hostnames(true);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}
