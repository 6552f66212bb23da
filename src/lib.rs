/*!
 * kvconnect - resilient execution engine for remote key-value stores
 *
 * A connector owns a bounded connection pool to one end-point and runs
 * operations against it with:
 * - per-key single-flight de-duplication of concurrent calls
 * - an optional circuit breaker in front of every physical execution
 * - per-operation command timeout override, restored before return
 * - classification of every failure into one error kind
 * - a reachability prober with linear backoff and jitter
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod classify;
pub mod codec;
pub mod commands;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod logging;
pub mod operation;
pub mod prober;
pub mod transport;

use std::sync::Arc;

// Re-export commonly used types
pub use codec::{BytesCodec, Utf8Codec, ValueCodec};
pub use commands::{Commands, TypedCommands};
pub use config::{ConfigError, ConfigStore, ConnectionMode, ConnectorConfig};
pub use endpoint::{EndpointAddress, EndpointDescriptor, Topology};
pub use engine::Connector;
pub use error::{ConnectorError, ErrorKind, InvalidArgument, Result, StoreError};
pub use operation::{Operation, OperationKey};
pub use prober::{ProbeReport, ReachabilityProber};
pub use transport::resp::{RespConnection, RespFactory};
pub use transport::StoreConnection;
pub use kvconnect_core_resilience::{CircuitState, PoolStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Validate `config`, build a RESP connector and wait until its end-point
/// answers.
pub async fn connect(config: &ConnectorConfig) -> Result<Connector<RespConnection>> {
    config
        .validate()
        .map_err(|err| ConnectorError::invalid_arguments(err.to_string()).with_cause(err))?;

    let endpoint = EndpointDescriptor::from_config(config)?;
    let factory = RespFactory::new(endpoint.clone())?;
    Connector::start(endpoint, Arc::new(factory), config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_connect_rejects_tls() {
        let config = ConnectorConfig {
            ssl: true,
            ..ConnectorConfig::default()
        };
        let err = connect(&config).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }
}
