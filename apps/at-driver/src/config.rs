use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::cli::Cli;
use crate::platform::{Platform, UnsupportedPlatform};
use crate::voice::{VoiceEndpoint, VoiceOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen host \"{0}\"")]
    InvalidHost(String),
    #[error(transparent)]
    Platform(#[from] UnsupportedPlatform),
    #[error("voice read timeout must be at least one second")]
    ZeroReadTimeout,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub platform: Platform,
    pub voice_endpoint: VoiceEndpoint,
    pub voice: VoiceOptions,
}

impl Config {
    /// Resolve CLI settings for an explicit platform.
    pub fn for_platform(cli: Cli, platform: Platform) -> Result<Self, ConfigError> {
        let host: IpAddr = cli
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(cli.host.clone()))?;
        if cli.voice_read_timeout_secs == 0 {
            return Err(ConfigError::ZeroReadTimeout);
        }
        let voice_endpoint = match cli.voice_endpoint.as_deref() {
            Some(location) => VoiceEndpoint::from_location(platform, location),
            None => VoiceEndpoint::for_platform(platform),
        };
        Ok(Config {
            listen_addr: SocketAddr::new(host, cli.port),
            platform,
            voice_endpoint,
            voice: VoiceOptions {
                read_timeout: Duration::from_secs(cli.voice_read_timeout_secs),
                ..VoiceOptions::default()
            },
        })
    }
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let platform = Platform::host()?;
        Config::for_platform(cli, platform)
    }
}
