#[cfg(feature = "config")]
use core_config::{ConfigError, FromEnv, env_list, env_optional, env_parse};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_NATIVE_PORT: u16 = 9042;
pub const DEFAULT_RPC_PORT: u16 = 9160;
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 250;
pub const DEFAULT_MIN_RECONNECTION_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_RECONNECTION_DELAY_MS: u64 = 60_000;
pub const DEFAULT_QUERY_RETRY_COUNT: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Username/password pair for the password authenticator
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection settings for one Cassandra cluster
///
/// Immutable value type and the key of the shared cluster cache: managers
/// built from equal configs share one cluster handle. A manager may replace
/// its config with a copy whose host set was narrowed to the local datacenter
/// (see [`ConnectionConfig::with_hosts`]).
///
/// # Example
///
/// ```ignore
/// use cassandra_connector::cql::ConnectionConfig;
///
/// let config = ConnectionConfig::new(["10.0.0.1".parse()?, "10.0.0.2".parse()?])
///     .with_credentials("loader", "secret")
///     .with_keep_alive(Duration::from_secs(5));
///
/// // From environment variables (requires `config` feature)
/// let config = ConnectionConfig::from_env()?;
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    /// Contact hosts
    pub hosts: BTreeSet<IpAddr>,

    /// Native protocol port
    pub native_port: u16,

    /// Thrift RPC port, kept for tooling that still talks to it
    pub rpc_port: u16,

    /// Optional password authentication
    pub credentials: Option<Credentials>,

    /// Datacenter to prefer when the contact hosts do not pin one
    pub local_datacenter: Option<String>,

    /// How long an unused cluster handle stays cached
    pub keep_alive_ms: u64,

    /// First reconnection delay
    pub min_reconnection_delay_ms: u64,

    /// Upper bound of the reconnection delay
    pub max_reconnection_delay_ms: u64,

    /// Retries of a failed statement before the driver gives up on it
    pub query_retry_count: u32,

    /// Timeout for establishing a connection
    pub connect_timeout_ms: u64,
}

impl ConnectionConfig {
    /// Create a config with default ports and tuning for the given hosts
    pub fn new(hosts: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
            native_port: DEFAULT_NATIVE_PORT,
            rpc_port: DEFAULT_RPC_PORT,
            credentials: None,
            local_datacenter: None,
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            min_reconnection_delay_ms: DEFAULT_MIN_RECONNECTION_DELAY_MS,
            max_reconnection_delay_ms: DEFAULT_MAX_RECONNECTION_DELAY_MS,
            query_retry_count: DEFAULT_QUERY_RETRY_COUNT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    /// Same settings, different host set
    pub fn with_hosts(&self, hosts: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
            ..self.clone()
        }
    }

    pub fn with_native_port(mut self, port: u16) -> Self {
        self.native_port = port;
        self
    }

    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.local_datacenter = Some(datacenter.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_ms = keep_alive.as_millis() as u64;
        self
    }

    pub fn with_reconnection_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnection_delay_ms = min.as_millis() as u64;
        self.max_reconnection_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_query_retry_count(mut self, count: u32) -> Self {
        self.query_retry_count = count;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Host addresses combined with the native port
    pub fn contact_points(&self) -> Vec<SocketAddr> {
        self.hosts
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.native_port))
            .collect()
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// First and longest delay between reconnection attempts to a node
    pub fn reconnection_delay(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_reconnection_delay_ms),
            Duration::from_millis(self.max_reconnection_delay_ms),
        )
    }
}

/// Resolve a host given as an IP literal or a DNS name
pub fn resolve_host(host: &str) -> Result<Vec<IpAddr>, String> {
    use std::net::ToSocketAddrs;

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs: Vec<IpAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve '{host}': {e}"))?
        .map(|addr| addr.ip())
        .collect();

    if addrs.is_empty() {
        return Err(format!("'{host}' resolved to no addresses"));
    }
    Ok(addrs)
}

/// Load ConnectionConfig from environment variables
///
/// Environment variables:
/// - `CASSANDRA_CONNECTION_HOST` (required) - Comma-separated IPs or host names
/// - `CASSANDRA_CONNECTION_NATIVE_PORT` (optional, default: 9042)
/// - `CASSANDRA_CONNECTION_RPC_PORT` (optional, default: 9160)
/// - `CASSANDRA_AUTH_USERNAME` / `CASSANDRA_AUTH_PASSWORD` (optional, both or neither)
/// - `CASSANDRA_CONNECTION_LOCAL_DC` (optional)
/// - `CASSANDRA_CONNECTION_KEEP_ALIVE_MS` (optional, default: 250)
/// - `CASSANDRA_CONNECTION_RECONNECTION_DELAY_MS_MIN` (optional, default: 1000)
/// - `CASSANDRA_CONNECTION_RECONNECTION_DELAY_MS_MAX` (optional, default: 60000)
/// - `CASSANDRA_QUERY_RETRY_COUNT` (optional, default: 10)
/// - `CASSANDRA_CONNECTION_TIMEOUT_MS` (optional, default: 5000)
#[cfg(feature = "config")]
impl FromEnv for ConnectionConfig {
    fn from_env() -> Result<Self, ConfigError> {
        const HOST_KEY: &str = "CASSANDRA_CONNECTION_HOST";

        let mut hosts = BTreeSet::new();
        for host in env_list(HOST_KEY)? {
            let resolved = resolve_host(&host).map_err(|details| ConfigError::ParseError {
                key: HOST_KEY.to_string(),
                details,
            })?;
            hosts.extend(resolved);
        }

        let credentials = match (
            env_optional("CASSANDRA_AUTH_USERNAME"),
            env_optional("CASSANDRA_AUTH_PASSWORD"),
        ) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::ParseError {
                    key: "CASSANDRA_AUTH_USERNAME".to_string(),
                    details: "username and password must be set together".to_string(),
                });
            }
        };

        Ok(Self {
            hosts,
            native_port: env_parse("CASSANDRA_CONNECTION_NATIVE_PORT", DEFAULT_NATIVE_PORT)?,
            rpc_port: env_parse("CASSANDRA_CONNECTION_RPC_PORT", DEFAULT_RPC_PORT)?,
            credentials,
            local_datacenter: env_optional("CASSANDRA_CONNECTION_LOCAL_DC"),
            keep_alive_ms: env_parse("CASSANDRA_CONNECTION_KEEP_ALIVE_MS", DEFAULT_KEEP_ALIVE_MS)?,
            min_reconnection_delay_ms: env_parse(
                "CASSANDRA_CONNECTION_RECONNECTION_DELAY_MS_MIN",
                DEFAULT_MIN_RECONNECTION_DELAY_MS,
            )?,
            max_reconnection_delay_ms: env_parse(
                "CASSANDRA_CONNECTION_RECONNECTION_DELAY_MS_MAX",
                DEFAULT_MAX_RECONNECTION_DELAY_MS,
            )?,
            query_retry_count: env_parse("CASSANDRA_QUERY_RETRY_COUNT", DEFAULT_QUERY_RETRY_COUNT)?,
            connect_timeout_ms: env_parse(
                "CASSANDRA_CONNECTION_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )?,
        })
    }
}
