use std::time::Duration;

use config::builder::DefaultState;
use config::{File, FileFormat, Source};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = r#"
# 0 means no request timeout (wait indefinitely)
request_timeout_ms = 30000
preferred_packet_length = 1468
max_packet_length = 65535
"#;

/// Runtime configuration for one grid service: the request-timeout policy
/// applied to every `RequestMessage`, and the transport MTU-derived packet
/// size bounds used by packetization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub request_timeout_ms: u64,
    pub preferred_packet_length: usize,
    pub max_packet_length: usize,
}

impl GridConfig {
    pub fn builder() -> GridConfigBuilder {
        GridConfigBuilder::default()
    }

    /// The configured request timeout; `None` means wait indefinitely.
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.request_timeout_ms))
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            request_timeout_ms: 30_000,
            preferred_packet_length: 1468,
            max_packet_length: 65_535,
        }
    }
}

#[derive(Debug, Default)]
pub struct GridConfigBuilder {
    builder: config::ConfigBuilder<DefaultState>,
}

impl GridConfigBuilder {
    /// Layer a caller-supplied source over the built-in defaults.
    pub fn add_source<T>(self, source: T) -> Self
    where
        T: Source + Send + Sync + 'static,
    {
        Self {
            builder: self.builder.add_source(source),
        }
    }

    pub fn build(self) -> anyhow::Result<GridConfig> {
        // defaults go first so caller sources override them
        let builder = config::ConfigBuilder::<DefaultState>::default()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));
        let merged = builder.add_source(self.builder.build()?).build()?;
        let grid_config = merged.try_deserialize::<GridConfig>()?;
        Ok(grid_config)
    }
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};

    use super::*;

    #[test]
    fn test_defaults() -> anyhow::Result<()> {
        let config = GridConfig::builder().build()?;
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.preferred_packet_length, 1468);
        assert_eq!(config.max_packet_length, 65_535);
        Ok(())
    }

    #[test]
    fn test_override_and_sentinel() -> anyhow::Result<()> {
        let config = GridConfig::builder()
            .add_source(File::from_str(
                "request_timeout_ms = 0",
                FileFormat::Toml,
            ))
            .build()?;
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.preferred_packet_length, 1468);
        Ok(())
    }
}
