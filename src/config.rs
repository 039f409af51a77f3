use serde::Deserialize;
use std::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

/// Limits applied by the HTTP codec and aggregation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Maximum length of the request line.
    pub max_initial_line_length: usize,
    /// Maximum size of the header block.
    pub max_header_size: usize,
    /// Maximum size of a single body chunk.
    pub max_chunk_size: usize,
    /// Maximum size of an aggregated message body.
    pub max_content_length: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_chunk_size: 5 * 1024 * 1024,
            max_content_length: 5 * 1024 * 1024,
        }
    }
}

/// Configuration for the server.
///
/// Loaded from an optional `config` file and environment variables with the
/// "MUXLET_" prefix. The exchange engine only reads the codec limits, the
/// response buffer size and the default response encoding; the rest sizes the
/// worker pool and the listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Maximum number of worker threads. Defaults to CPU count * 15.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Keep-alive duration in seconds for idle worker threads.
    #[serde(default = "default_keep_alive_secs")]
    pub worker_keep_alive_secs: u64,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_initial_line_length")]
    pub max_initial_line_length: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_content_length: usize,
    /// Bytes buffered by a response before it flushes on its own.
    #[serde(default = "default_response_buffer_size")]
    pub response_buffer_size: usize,
    /// Encoding used by response writers when nothing else is declared.
    #[serde(default = "default_response_character_encoding")]
    pub response_character_encoding: String,
    /// How long a new connection may stay silent before it is dropped unsniffed.
    #[serde(default = "default_sniff_timeout_ms")]
    pub sniff_timeout_ms: u64,
    /// PEM certificate chain; HTTPS is enabled when both paths are set.
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub http1_keep_alive: bool,
    #[serde(default)]
    pub http1_half_close: bool,
    #[serde(default)]
    pub http1_title_case_headers: bool,
    #[serde(default)]
    pub http1_preserve_header_case: bool,
}

impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    /// Loads the configuration.
    ///
    /// Sources, lowest precedence first: a `.env` file, a "config" file (if it
    /// exists), then "MUXLET_" environment variables.
    ///
    /// # Errors
    /// Returns a ConfigError if configuration loading or parsing fails.
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("MUXLET"));

        builder.build()?.try_into()
    }

    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.worker_keep_alive_secs)
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_millis(self.sniff_timeout_ms)
    }

    /// Socket address string the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_initial_line_length: self.max_initial_line_length,
            max_header_size: self.max_header_size,
            max_chunk_size: self.max_chunk_size,
            max_content_length: self.max_content_length,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

fn default_max_workers() -> usize {
    num_cpus::get() * 15
}

fn default_keep_alive_secs() -> u64 {
    6
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_initial_line_length() -> usize {
    4096
}

fn default_max_header_size() -> usize {
    8192
}

/// 5 MiB, shared by the chunk and aggregation limits.
fn default_max_message_size() -> usize {
    5 * 1024 * 1024
}

fn default_response_buffer_size() -> usize {
    8192
}

fn default_response_character_encoding() -> String {
    "utf-8".to_string()
}

fn default_sniff_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_keep_alive_secs: default_keep_alive_secs(),
            host: default_host(),
            port: default_port(),
            max_initial_line_length: default_max_initial_line_length(),
            max_header_size: default_max_header_size(),
            max_chunk_size: default_max_message_size(),
            max_content_length: default_max_message_size(),
            response_buffer_size: default_response_buffer_size(),
            response_character_encoding: default_response_character_encoding(),
            sniff_timeout_ms: default_sniff_timeout_ms(),
            tls_cert_path: None,
            tls_key_path: None,
            http1_keep_alive: true,
            http1_half_close: false,
            http1_title_case_headers: false,
            http1_preserve_header_case: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Tests that the default configuration values are set correctly.
    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_workers, num_cpus::get() * 15);
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
        assert!(!config.tls_enabled());
    }

    /// The default codec limits are the fixed pipeline limits.
    #[test]
    fn test_default_codec_limits() {
        let limits = ServerConfig::default().codec_limits();
        assert_eq!(limits, CodecLimits::default());
        assert_eq!(limits.max_initial_line_length, 4096);
        assert_eq!(limits.max_header_size, 8192);
        assert_eq!(limits.max_chunk_size, 5 * 1024 * 1024);
        assert_eq!(limits.max_content_length, 5 * 1024 * 1024);
    }

    /// Tests configuration loading from environment variables.
    /// Verifies that the ServerConfig correctly reads and applies
    /// values from environment variables with the "MUXLET_" prefix.
    #[test]
    fn test_config_from_env() {
        env::set_var("MUXLET_PORT", "9000");
        env::set_var("MUXLET_HOST", "0.0.0.0");
        env::set_var("MUXLET_MAX_WORKERS", "4");

        let config = ServerConfig::new().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_header_size, 8192);

        env::remove_var("MUXLET_PORT");
        env::remove_var("MUXLET_HOST");
        env::remove_var("MUXLET_MAX_WORKERS");
    }
}
