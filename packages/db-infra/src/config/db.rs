use std::fmt;
use std::path::PathBuf;

use migration::Migration;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::{must_var, optional_var, parse_var, process_env};
use crate::error::{DbInfraError, Tier};

/// Maintenance database the admin tier connects to when none is configured.
pub const DEFAULT_ADMIN_DATABASE: &str = "postgres";

// RFC 3986 unreserved characters stay as-is; everything else is escaped.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Resolved connection parameters for one credential tier.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Directory holding `ca.crt` and `client.<user>.{crt,key}`; enables TLS when set
    pub certs_dir: Option<PathBuf>,
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("certs_dir", &self.certs_dir)
            .finish()
    }
}

/// Certificate files expected inside the certs directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl ConnectConfig {
    pub fn tls_files(&self) -> Option<TlsFiles> {
        self.certs_dir.as_ref().map(|dir| TlsFiles {
            ca_cert: dir.join("ca.crt"),
            client_cert: dir.join(format!("client.{}.crt", self.username)),
            client_key: dir.join(format!("client.{}.key", self.username)),
        })
    }

    /// Connection URL handed to the driver.
    pub fn url(&self) -> String {
        self.build_url(false)
    }

    /// Same as [`ConnectConfig::url`] with the password masked, for logging.
    pub fn redacted_url(&self) -> String {
        self.build_url(true)
    }

    fn build_url(&self, redact: bool) -> String {
        let user = encode(&self.username);
        let auth = match (self.password.is_empty(), redact) {
            (true, _) => user,
            (false, true) => format!("{user}:***"),
            (false, false) => format!("{user}:{}", encode(&self.password)),
        };

        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        let mut url = format!(
            "postgres://{auth}@{host}:{}/{}",
            self.port,
            encode(&self.database)
        );

        if let Some(tls) = self.tls_files() {
            url.push_str(&format!(
                "?sslmode=require&sslrootcert={}&sslcert={}&sslkey={}",
                encode(&tls.ca_cert.to_string_lossy()),
                encode(&tls.client_cert.to_string_lossy()),
                encode(&tls.client_key.to_string_lossy()),
            ));
        }

        url
    }

    fn validate(&self, tier: Tier, password_required: bool) -> Result<(), DbInfraError> {
        let blank = |value: &str| value.trim().is_empty();

        if blank(&self.host) {
            return Err(DbInfraError::config(format!("{tier} connection: host is empty")));
        }
        if self.port == 0 {
            return Err(DbInfraError::config(format!("{tier} connection: port must be non-zero")));
        }
        if blank(&self.username) {
            return Err(DbInfraError::config(format!("{tier} connection: username is empty")));
        }
        if password_required && self.password.is_empty() {
            return Err(DbInfraError::config(format!("{tier} connection: password is empty")));
        }
        if blank(&self.database) {
            return Err(DbInfraError::config(format!("{tier} connection: database is empty")));
        }
        if let Some(dir) = &self.certs_dir {
            if dir.as_os_str().is_empty() {
                return Err(DbInfraError::config(format!(
                    "{tier} connection: certificate directory is empty"
                )));
            }
        }
        Ok(())
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, URL_COMPONENT).to_string()
}

fn port_var(lookup: &impl Fn(&str) -> Option<String>) -> Result<u16, DbInfraError> {
    parse_var::<u16>(lookup, "POSTGRES_PORT")?.ok_or_else(|| {
        DbInfraError::config("Required environment variable 'POSTGRES_PORT' is not set")
    })
}

/// Elevated credentials; only accepted by provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminConfig(ConnectConfig);

impl AdminConfig {
    /// Validate an explicit record. The admin password may be empty.
    pub fn new(config: ConnectConfig) -> Result<Self, DbInfraError> {
        config.validate(Tier::Admin, false)?;
        Ok(Self(config))
    }

    pub fn from_env() -> Result<Self, DbInfraError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DbInfraError> {
        Self::new(ConnectConfig {
            host: must_var(&lookup, "POSTGRES_HOST")?,
            port: port_var(&lookup)?,
            username: must_var(&lookup, "POSTGRES_ADMIN_USER")?,
            password: optional_var(&lookup, "POSTGRES_ADMIN_PASS").unwrap_or_default(),
            database: optional_var(&lookup, "POSTGRES_ADMIN_NAME")
                .unwrap_or_else(|| DEFAULT_ADMIN_DATABASE.to_string()),
            certs_dir: optional_var(&lookup, "POSTGRES_CERTS").map(PathBuf::from),
        })
    }

    pub fn connect_config(&self) -> &ConnectConfig {
        &self.0
    }
}

/// Schema-owning credentials; only accepted by the migration runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig(ConnectConfig);

impl TargetConfig {
    /// Validate an explicit record. Every field except the certs dir is required.
    pub fn new(config: ConnectConfig) -> Result<Self, DbInfraError> {
        config.validate(Tier::Target, true)?;
        Ok(Self(config))
    }

    pub fn from_env() -> Result<Self, DbInfraError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DbInfraError> {
        Self::new(ConnectConfig {
            host: must_var(&lookup, "POSTGRES_HOST")?,
            port: port_var(&lookup)?,
            username: must_var(&lookup, "POSTGRES_USER")?,
            password: must_var(&lookup, "POSTGRES_PASS")?,
            database: must_var(&lookup, "POSTGRES_NAME")?,
            certs_dir: optional_var(&lookup, "POSTGRES_CERTS").map(PathBuf::from),
        })
    }

    pub fn connect_config(&self) -> &ConnectConfig {
        &self.0
    }

    pub fn username(&self) -> &str {
        &self.0.username
    }

    pub fn database(&self) -> &str {
        &self.0.database
    }
}

/// Flat shape for services that already hold enough privilege; no provisioning.
#[derive(Clone)]
pub struct SingleTierConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub certs_dir: Option<PathBuf>,
    pub migrations: Vec<Migration>,
}

impl fmt::Debug for SingleTierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleTierConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("certs_dir", &self.certs_dir)
            .field("migrations", &self.migrations.len())
            .finish()
    }
}

impl SingleTierConfig {
    pub fn from_env(migrations: Vec<Migration>) -> Result<Self, DbInfraError> {
        Self::from_lookup(process_env, migrations)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        migrations: Vec<Migration>,
    ) -> Result<Self, DbInfraError> {
        let TargetConfig(config) = TargetConfig::from_lookup(lookup)?;
        Ok(Self {
            host: config.host,
            port: config.port,
            username: config.username,
            password: config.password,
            database: config.database,
            certs_dir: config.certs_dir,
            migrations,
        })
    }

    pub fn target(&self) -> Result<TargetConfig, DbInfraError> {
        TargetConfig::new(ConnectConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            certs_dir: self.certs_dir.clone(),
        })
    }
}

/// Separate admin and target descriptors; provisioning runs first.
#[derive(Debug, Clone)]
pub struct TwoTierConfig {
    pub admin: AdminConfig,
    pub target: TargetConfig,
    pub migrations: Vec<Migration>,
}

impl TwoTierConfig {
    pub fn from_env(migrations: Vec<Migration>) -> Result<Self, DbInfraError> {
        Self::from_lookup(process_env, migrations)
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        migrations: Vec<Migration>,
    ) -> Result<Self, DbInfraError> {
        Ok(Self {
            admin: AdminConfig::from_lookup(&lookup)?,
            target: TargetConfig::from_lookup(&lookup)?,
            migrations,
        })
    }
}

#[derive(Debug, Clone)]
pub enum MigrationConfig {
    SingleTier(SingleTierConfig),
    TwoTier(TwoTierConfig),
}

impl MigrationConfig {
    pub fn migrations(&self) -> &[Migration] {
        match self {
            MigrationConfig::SingleTier(config) => &config.migrations,
            MigrationConfig::TwoTier(config) => &config.migrations,
        }
    }
}
