/*!
 * End-point addressing
 *
 * Turns the configured `host[:port]` list into an [`EndpointDescriptor`]: one
 * stand-alone server, a sentinel group resolving a master, or a cluster node
 * list, plus the connection decorations (TLS, credentials, database, client
 * name, command timeout) every physical connection is opened with.
 */

use crate::config::{ConnectionMode, ConnectorConfig};
use crate::error::ConnectorError;
use std::fmt;
use std::time::Duration;

/// Fallback host when no hosts are configured
pub const DEFAULT_HOST: &str = "localhost";

/// Base client name announced to the server
pub const DEFAULT_CLIENT_NAME: &str = "kvconnect";

/// A host/port pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    host: String,
    port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse one `host[:port]` entry. Bracketed IPv6 hosts (`[::1]:6379`) are
    /// accepted; the brackets are not part of the stored host.
    pub fn parse(entry: &str, default_port: u16) -> Result<Self, ConnectorError> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(ConnectorError::invalid_arguments("Empty host entry"));
        }

        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                ConnectorError::invalid_arguments(format!("Unterminated IPv6 host: {}", entry))
            })?;
            match after {
                "" => (host, None),
                _ => match after.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(ConnectorError::invalid_arguments(format!(
                            "Invalid host entry: {}",
                            entry
                        )))
                    }
                },
            }
        } else {
            match entry.rsplit_once(':') {
                // A bare IPv6 literal has several colons and no port
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (entry, None),
            }
        };

        let host = host.trim();
        if host.is_empty() {
            return Err(ConnectorError::invalid_arguments(format!(
                "Missing host in entry: {}",
                entry
            )));
        }

        let port = match port {
            None => default_port,
            Some(port) => port.trim().parse::<u16>().map_err(|_| {
                ConnectorError::invalid_arguments(format!(
                    "Invalid port in host entry: {}",
                    entry
                ))
            })?,
        };

        Ok(Self::new(host, port))
    }

    /// Parse a comma-separated host list, skipping blank entries
    pub fn parse_list(list: &str, default_port: u16) -> Result<Vec<Self>, ConnectorError> {
        list.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| Self::parse(entry, default_port))
            .collect()
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    Standalone(EndpointAddress),
    Sentinel {
        master_id: String,
        sentinels: Vec<EndpointAddress>,
    },
    Cluster(Vec<EndpointAddress>),
}

/// Credentials sent after connect
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
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

/// A fully decorated end-point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub topology: Topology,
    pub ssl: bool,
    pub starttls: bool,
    pub verify_peer: bool,
    pub database: u32,
    pub credentials: Option<Credentials>,
    pub client_name: String,
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
}

impl EndpointDescriptor {
    /// Build the descriptor from configuration
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let default_port = config.mode.default_port();
        let mut hosts = EndpointAddress::parse_list(&config.hosts, default_port)?;
        if hosts.is_empty() {
            hosts.push(EndpointAddress::new(DEFAULT_HOST, default_port));
        }

        let topology = match config.mode {
            ConnectionMode::Standalone => {
                // Extra hosts have no meaning for a single server; use the first
                Topology::Standalone(hosts.swap_remove(0))
            }
            ConnectionMode::Sentinel => {
                let master_id = config
                    .sentinel_master_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        ConnectorError::invalid_arguments("Sentinel mode requires a master id")
                    })?;
                Topology::Sentinel {
                    master_id: master_id.to_string(),
                    sentinels: hosts,
                }
            }
            ConnectionMode::Cluster => Topology::Cluster(hosts),
        };

        let credentials = config
            .password
            .as_ref()
            .filter(|password| !password.is_empty())
            .map(|password| Credentials {
                username: config.username.clone().filter(|user| !user.is_empty()),
                password: password.clone(),
            });

        let base_name = config
            .client_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_CLIENT_NAME);

        Ok(Self {
            topology,
            ssl: config.ssl,
            starttls: config.starttls,
            verify_peer: config.verify_peer,
            database: config.database,
            credentials,
            client_name: format!("{}-v{}", base_name, env!("CARGO_PKG_VERSION")),
            command_timeout: config.command_timeout(),
            connect_timeout: config.connect_timeout(),
        })
    }

    /// A plain stand-alone descriptor with default decorations
    pub fn standalone(address: EndpointAddress) -> Self {
        Self {
            topology: Topology::Standalone(address),
            ssl: false,
            starttls: false,
            verify_peer: true,
            database: 0,
            credentials: None,
            client_name: format!("{}-v{}", DEFAULT_CLIENT_NAME, env!("CARGO_PKG_VERSION")),
            command_timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(5000),
        }
    }

    /// Addresses to try when opening a connection, in order
    pub fn addresses(&self) -> &[EndpointAddress] {
        match &self.topology {
            Topology::Standalone(address) => std::slice::from_ref(address),
            Topology::Sentinel { sentinels, .. } => sentinels,
            Topology::Cluster(nodes) => nodes,
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.ssl { "rediss" } else { "redis" };
        match &self.topology {
            Topology::Standalone(address) => write!(f, "{}://{}", scheme, address)?,
            Topology::Sentinel {
                master_id,
                sentinels,
            } => {
                write!(f, "{}-sentinel://", scheme)?;
                write_list(f, sentinels)?;
                write!(f, "#{}", master_id)?;
            }
            Topology::Cluster(nodes) => {
                write!(f, "{}-cluster://", scheme)?;
                write_list(f, nodes)?;
            }
        }
        if self.database > 0 {
            write!(f, "/{}", self.database)?;
        }
        Ok(())
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, addresses: &[EndpointAddress]) -> fmt::Result {
    for (i, address) in addresses.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", address)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_entries() {
        assert_eq!(
            EndpointAddress::parse("cache", 6379).unwrap(),
            EndpointAddress::new("cache", 6379)
        );
        assert_eq!(
            EndpointAddress::parse(" cache:7000 ", 6379).unwrap(),
            EndpointAddress::new("cache", 7000)
        );
        assert_eq!(
            EndpointAddress::parse("[::1]:7001", 6379).unwrap(),
            EndpointAddress::new("::1", 7001)
        );
        assert_eq!(
            EndpointAddress::parse("[::1]", 6379).unwrap(),
            EndpointAddress::new("::1", 6379)
        );
        assert_eq!(
            EndpointAddress::parse("fe80::1", 6379).unwrap(),
            EndpointAddress::new("fe80::1", 6379)
        );
    }

    #[test]
    fn test_bad_port_is_invalid_argument() {
        let err = EndpointAddress::parse("cache:http", 6379).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        assert!(EndpointAddress::parse("cache:70000", 6379).is_err());
        assert!(EndpointAddress::parse(":6379", 6379).is_err());
    }

    #[test]
    fn test_parse_list_skips_blanks() {
        let list = EndpointAddress::parse_list("a:1, ,b,,", 26379).unwrap();
        assert_eq!(
            list,
            vec![EndpointAddress::new("a", 1), EndpointAddress::new("b", 26379)]
        );
        assert!(EndpointAddress::parse_list("  ", 6379).unwrap().is_empty());
    }

    #[test]
    fn test_address_equality_covers_both_fields() {
        use std::collections::HashSet;
        let set: HashSet<_> = [
            EndpointAddress::new("a", 1),
            EndpointAddress::new("a", 1),
            EndpointAddress::new("a", 2),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_empty_hosts_fall_back_to_localhost() {
        let config = ConnectorConfig::default();
        let descriptor = EndpointDescriptor::from_config(&config).unwrap();
        assert_eq!(
            descriptor.topology,
            Topology::Standalone(EndpointAddress::new("localhost", 6379))
        );
        assert_eq!(descriptor.to_string(), "redis://localhost:6379");
    }

    #[test]
    fn test_sentinel_descriptor() {
        let config = ConnectorConfig {
            mode: ConnectionMode::Sentinel,
            hosts: "s1,s2:26380".into(),
            sentinel_master_id: Some("primary".into()),
            database: 2,
            ..Default::default()
        };
        let descriptor = EndpointDescriptor::from_config(&config).unwrap();
        assert_eq!(
            descriptor.addresses(),
            &[
                EndpointAddress::new("s1", 26379),
                EndpointAddress::new("s2", 26380)
            ]
        );
        assert_eq!(
            descriptor.to_string(),
            "redis-sentinel://s1:26379,s2:26380#primary/2"
        );

        let missing = ConnectorConfig {
            sentinel_master_id: None,
            ..config
        };
        assert!(EndpointDescriptor::from_config(&missing).is_err());
    }

    #[test]
    fn test_cluster_descriptor() {
        let config = ConnectorConfig {
            mode: ConnectionMode::Cluster,
            hosts: "n1,n2,n3:7000".into(),
            ssl: true,
            ..Default::default()
        };
        let descriptor = EndpointDescriptor::from_config(&config).unwrap();
        assert_eq!(descriptor.addresses().len(), 3);
        assert_eq!(
            descriptor.to_string(),
            "rediss-cluster://n1:6379,n2:6379,n3:7000"
        );
    }

    #[test]
    fn test_decorations() {
        let config = ConnectorConfig {
            username: Some("app".into()),
            password: Some("hunter2".into()),
            client_name: Some("billing".into()),
            command_timeout_millis: -5,
            ..Default::default()
        };
        let descriptor = EndpointDescriptor::from_config(&config).unwrap();

        let credentials = descriptor.credentials.clone().unwrap();
        assert_eq!(credentials.username.as_deref(), Some("app"));
        assert!(descriptor
            .client_name
            .starts_with(&format!("billing-v{}", env!("CARGO_PKG_VERSION"))));
        assert_eq!(descriptor.command_timeout, Duration::ZERO);

        assert!(!descriptor.to_string().contains("hunter2"));
        assert!(!format!("{:?}", descriptor).contains("hunter2"));
    }

    #[test]
    fn test_default_client_name() {
        let descriptor = EndpointDescriptor::from_config(&ConnectorConfig::default()).unwrap();
        assert_eq!(
            descriptor.client_name,
            format!("kvconnect-v{}", env!("CARGO_PKG_VERSION"))
        );
        assert!(descriptor.credentials.is_none());
    }
}
