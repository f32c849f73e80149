//! Database related things.

use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use secrecy::{ExposeSecret, SecretString};
use std::{
    fs,
    path::{PathBuf, Path},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_postgres::NoTls;

use crate::prelude::*;


pub(crate) mod cmd;
mod conn;
mod migrations;
mod query;
pub(crate) mod util;

#[cfg(test)]
mod tests;

pub(crate) use self::{
    conn::Db,
    migrations::{migrate, MigrationPlan},
};


#[derive(Debug, confique::Config, Clone)]
pub(crate) struct DbConfig {
    /// Full connection string, e.g. `postgresql://user:pw@localhost:5432/db`.
    /// If set, it is used as base and the individual values below are
    /// ignored. Usually passed via the `DATABASE_URL` environment variable.
    #[config(env = "DATABASE_URL")]
    pub(crate) url: Option<SecretString>,

    /// The username of the database user.
    #[config(default = "postgraph")]
    pub(crate) user: String,

    /// The password of the database user.
    pub(crate) password: Option<SecretString>,

    /// The host the database server is running on.
    #[config(default = "127.0.0.1")]
    pub(crate) host: String,

    /// The port the database server is listening on.
    #[config(default = 5432)]
    pub(crate) port: u16,

    /// The name of the database to use.
    #[config(default = "postgraph")]
    pub(crate) database: String,

    /// The TLS mode for the database connection.
    ///
    /// - "on": encryption is required and the server certificate is validated
    ///    against trusted certificates which are loaded from the system's
    ///    native certificate store. If `server_cert` is set, that's also
    ///    loaded and trusted.
    /// - "off": no encryption.
    #[config(default = "off")]
    pub(crate) tls_mode: TlsMode,

    /// Path to the server certificate. This makes sense if you don't want to
    /// install the certificate globally on the system. Has to be a PEM encoded
    /// file containing one or more X509 certificates.
    pub(crate) server_cert: Option<PathBuf>,

    /// Maximum number of connections in the pool.
    #[config(default = 16)]
    pub(crate) max_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum TlsMode {
    Off,
    On,
}

impl DbConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.server_cert.is_some() && self.tls_mode != TlsMode::On {
            bail!(r#"`db.server_cert` is set, but TLS mode is NOT "on", which makes no sense"#);
        }
        if self.max_connections == 0 {
            bail!("`db.max_connections` has to be at least 1");
        }

        Ok(())
    }

    /// Checks that the server certificate file, if given, exists and is valid.
    /// Basically only for the `check` subcommand.
    pub(crate) fn check_server_cert(&self) -> Result<()> {
        if let Some(path) = &self.server_cert {
            let mut root_certs = rustls::RootCertStore::empty();
            load_pem_file(path, &mut root_certs)
                .with_context(|| format!("failed to load '{}'", path.display()))?;
        }
        Ok(())
    }

    /// A description of the database we connect to, without the password.
    pub(crate) fn display_target(&self) -> String {
        match &self.url {
            Some(url) => {
                let url = url.expose_secret();
                let rest = url.rsplit_once('@').map(|(_, rest)| rest).unwrap_or(url);
                format!("'postgresql://*****@{rest}' (from URL)")
            }
            None => format!(
                "'postgresql://{}:*****@{}:{}/{}'",
                self.user,
                self.host,
                self.port,
                self.database,
            ),
        }
    }

    fn pool_config(&self) -> PoolConfig {
        let mut pool_config = PoolConfig {
            application_name: Some("postgraph".into()),
            pool: Some(deadpool_postgres::PoolConfig::new(self.max_connections)),
            ssl_mode: Some(match self.tls_mode {
                TlsMode::Off => deadpool_postgres::SslMode::Disable,
                TlsMode::On => deadpool_postgres::SslMode::Require,
            }),
            .. PoolConfig::default()
        };

        match &self.url {
            Some(url) => pool_config.url = Some(url.expose_secret().to_owned()),
            None => {
                pool_config.user = Some(self.user.clone());
                pool_config.password = self.password.as_ref()
                    .map(|pw| pw.expose_secret().to_owned());
                pool_config.host = Some(self.host.clone());
                pool_config.port = Some(self.port);
                pool_config.dbname = Some(self.database.clone());
            }
        }

        pool_config
    }
}

/// Type alias for an owned DB connection.
pub(crate) type DbConnection = deadpool::managed::Object<deadpool_postgres::Manager>;


/// Creates the database connection pool without opening any connection.
pub(crate) fn build_pool(config: &DbConfig) -> Result<Pool> {
    let pool_config = config.pool_config();
    debug!("Connecting to {} (TLS: {:?})", config.display_target(), config.tls_mode);

    let pool = match config.tls_mode {
        TlsMode::Off => pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?,
        TlsMode::On => {
            let mut root_certs = rustls::RootCertStore::empty();
            let system_certs = rustls_native_certs::load_native_certs();
            for e in &system_certs.errors {
                warn!("Error while loading system-wide certificates: {e}");
            }
            let (added, ignored) = root_certs.add_parsable_certificates(system_certs.certs);
            debug!("Loaded {added} system-wide certificates ({ignored} ignored)");

            // If a custom cert is given, we try to load it.
            if let Some(cert_path) = &config.server_cert {
                let custom_count = load_pem_file(cert_path, &mut root_certs)
                    .with_context(|| format!("failed to load '{}'", cert_path.display()))?;
                debug!("Loaded {} certificates from '{}'", custom_count, cert_path.display());
            }

            let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
            let tls_config = rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .context("failed to configure TLS protocol versions")?
                .with_root_certificates(root_certs)
                .with_no_client_auth();

            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            pool_config.create_pool(Some(Runtime::Tokio1), tls)?
        }
    };

    Ok(pool)
}

/// Creates a new database connection pool and makes sure the database is
/// reachable and uses the correct encoding.
pub(crate) async fn create_pool(config: &DbConfig) -> Result<Pool> {
    let pool = build_pool(config)?;
    info!("Created database pool");

    // Test the connection by executing a simple query.
    let client = pool.get().await
        .context("failed to get DB connection")?;
    client.execute("select 1", &[]).await
        .context("failed to execute DB test query")?;
    debug!("Successfully tested database connection with test query");

    // Make sure the database uses UTF8 encoding. There is no good reason to use
    // anything else.
    let encoding = client.query_one("show server_encoding;", &[]).await
        .context("failed to check server encoding")?
        .get::<_, String>(0);

    if encoding != "UTF8" {
        bail!("Database encoding is not UTF8, but postgraph requires UTF8!");
    }

    Ok(pool)
}

/// Checks out one DB connection from the pool, warning if that takes
/// suspiciously long.
pub(crate) async fn get_conn(pool: &Pool) -> Result<DbConnection, deadpool_postgres::PoolError> {
    let before = Instant::now();
    let connection = pool.get().await?;

    let acquire_conn_time = before.elapsed();
    if acquire_conn_time > Duration::from_millis(5) {
        warn!("Acquiring DB connection from pool took {:.2?}", acquire_conn_time);
    }

    Ok(connection)
}


/// Loads the PEM file at `path` and adds all X509 certificates in it to
/// `root_certs`. Returns an error if a non-x509 item is found. Returns the
/// number of certs added to `root_certs`.
fn load_pem_file(path: &Path, root_certs: &mut rustls::RootCertStore) -> Result<usize> {
    let file = fs::read(path).context("could not read file")?;

    let mut count = 0;
    for item in rustls_pemfile::read_all(&mut &*file) {
        match item.context("could not parse file as PEM")? {
            rustls_pemfile::Item::X509Certificate(cert) => {
                root_certs.add(cert).context("failed to load X509 certificate")?;
                count += 1;
            }
            _ => bail!("found unexpected item, expected X509 certificate"),
        }
    }

    Ok(count)
}
