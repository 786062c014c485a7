use crate::net::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Method invocations allowed to run at once, across all connections.
    pub workers: usize,
    /// Connections beyond this many are refused. `None` means no limit.
    pub max_connections: Option<usize>,
    /// Largest inbound frame, in bytes. A client sending more is disconnected.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            max_connections: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for [`Client::send`](crate::Client::send). `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Calls allowed to be outstanding on one connection.
    pub max_pending: usize,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            max_pending: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{ "workers": 3 }"#).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_connections, None);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);

        let config: ClientConfig =
            serde_json::from_str(r#"{ "call_timeout": { "secs": 2, "nanos": 0 } }"#).unwrap();
        assert_eq!(config.call_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.max_pending, 1024);

        let config: ClientConfig = serde_json::from_str(r#"{ "max_frame_size": 4096 }"#).unwrap();
        assert_eq!(config.max_frame_size, 4096);
        assert_eq!(config.call_timeout, Some(Duration::from_secs(30)));
    }
}
