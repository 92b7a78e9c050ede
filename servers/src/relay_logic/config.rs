use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_relay::sources::SeekRange;

pub const DEFAULT_PORT: u16 = 9010;
pub const DEFAULT_INGEST_PORT: u16 = 9011;
pub const DEFAULT_CONFIG_FILE: &str = "server_relay.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Sim-racing telemetry relay server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_INGEST_PORT", help = "TCP port accepting the JSON-lines telemetry feed.")]
    pub ingest_port: Option<u16>,

    #[clap(long, env = "RELAY_PLAYBACK", help = "Replay this JSON-lines recording instead of the live feed.")]
    pub playback: Option<PathBuf>,

    #[clap(long, env = "RELAY_SEEK_START", help = "First recorded tick marker to replay.")]
    pub seek_start: Option<u64>,

    #[clap(long, env = "RELAY_SEEK_END", help = "Last recorded tick marker to replay.")]
    pub seek_end: Option<u64>,

    #[clap(long, env = "RELAY_TICK_INTERVAL_MS", help = "Period of the tick scheduler in milliseconds.")]
    pub tick_interval_ms: Option<u64>,

    #[clap(long, env = "RELAY_SOURCE_SILENCE_MS", help = "Milliseconds without a frame before the live feed counts as down (0 disables).")]
    pub source_silence_ms: Option<u64>,

    #[clap(long, env = "RELAY_SESSION_IDLE_SECS", help = "Seconds a session may go untouched before eviction (0 disables).")]
    pub session_idle_secs: Option<u64>,

    #[clap(long, env = "RELAY_SWEEP_INTERVAL_SECS", help = "Interval in seconds between idle-session sweeps.")]
    pub sweep_interval_secs: Option<u64>,

    #[clap(long, env = "RELAY_STREAM_CADENCE_MS", help = "Default push cadence in milliseconds for /stream connections.")]
    pub stream_cadence_ms: Option<u64>,

    #[clap(long, env = "RELAY_RECORD_PATH", help = "Directory to record ticks into (recorder disabled when unset).")]
    pub record_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_RECORD_PATHS", value_delimiter = ',', help = "Comma-separated telemetry paths the recorder captures.")]
    pub record_paths: Option<Vec<String>>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            ingest_port: other.ingest_port.or(self.ingest_port),
            playback: other.playback.or(self.playback),
            seek_start: other.seek_start.or(self.seek_start),
            seek_end: other.seek_end.or(self.seek_end),
            tick_interval_ms: other.tick_interval_ms.or(self.tick_interval_ms),
            source_silence_ms: other.source_silence_ms.or(self.source_silence_ms),
            session_idle_secs: other.session_idle_secs.or(self.session_idle_secs),
            sweep_interval_secs: other.sweep_interval_secs.or(self.sweep_interval_secs),
            stream_cadence_ms: other.stream_cadence_ms.or(self.stream_cadence_ms),
            record_path: other.record_path.or(self.record_path),
            record_paths: other.record_paths.or(self.record_paths),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(DEFAULT_PORT),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ingest_port: Some(DEFAULT_INGEST_PORT),
            tick_interval_ms: Some(16),
            source_silence_ms: Some(2000),
            session_idle_secs: Some(300),
            sweep_interval_secs: Some(30),
            stream_cadence_ms: Some(100),
            record_paths: Some(vec![
                "/Car/ME/Speed".to_string(),
                "/Car/ME/Rpm".to_string(),
                "/Car/ME/Gear".to_string(),
            ]),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn ingest_port(&self) -> u16 {
        self.ingest_port.unwrap_or(DEFAULT_INGEST_PORT)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn seek_range(&self) -> SeekRange {
        SeekRange {
            start: self.seek_start,
            end: self.seek_end,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.unwrap_or(16).max(1))
    }

    /// `None` when disabled.
    pub fn source_silence(&self) -> Option<Duration> {
        self.source_silence_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// `None` when disabled.
    pub fn session_idle(&self) -> Option<Duration> {
        self.session_idle_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(30).max(1))
    }

    pub fn stream_cadence(&self) -> Duration {
        Duration::from_millis(self.stream_cadence_ms.unwrap_or(100).max(1))
    }

    pub fn record_paths(&self) -> Vec<String> {
        self.record_paths.clone().unwrap_or_default()
    }

    /// Both TLS files, when both are configured and present on disk.
    pub fn tls_files(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) if cert.exists() && key.exists() => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }
}

pub fn load_config() -> Config {
    load_config_from(Config::parse())
}

/// Defaults < config file < environment/CLI.
pub fn load_config_from(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config = current_config.merge(cli);

    // Fall back to the LetsEncrypt files in the home directory when they exist.
    if current_config.tls_cert_path.is_none() && current_config.tls_key_path.is_none() {
        if let Some(home_dir) = dirs::home_dir() {
            let letsencrypt_dir = home_dir.join(".letsencrypt");
            let cert = letsencrypt_dir.join("fullchain.pem");
            let key = letsencrypt_dir.join("privkey.pem");
            if cert.exists() && key.exists() {
                current_config.tls_cert_path = Some(cert);
                current_config.tls_key_path = Some(key);
            }
        }
    }

    current_config
}

// Logging is not up yet while the config loads, hence eprintln.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 7000, "sessionIdleSecs": 60, "recordPaths": ["/Car/ME/Gear"]}}"#).unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(7100),
            ..Default::default()
        };
        let config = load_config_from(cli);
        assert_eq!(config.port(), 7100);
        assert_eq!(config.session_idle(), Some(Duration::from_secs(60)));
        assert_eq!(config.record_paths(), vec!["/Car/ME/Gear"]);
        assert_eq!(config.ingest_port(), DEFAULT_INGEST_PORT);
        assert_eq!(config.tick_interval(), Duration::from_millis(16));
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let config = load_config_from(Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.session_idle(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn zero_disables_timeouts() {
        let config = Config {
            source_silence_ms: Some(0),
            session_idle_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(config.source_silence(), None);
        assert_eq!(config.session_idle(), None);
    }

    #[test]
    fn parses_command_line() {
        let cli = Config::try_parse_from([
            "server_relay",
            "--playback",
            "lap.jsonl",
            "--seek-start",
            "100",
            "--record-paths",
            "/Car/ME/Speed,/Car/ME/Rpm",
        ])
        .unwrap();
        assert_eq!(cli.playback, Some(PathBuf::from("lap.jsonl")));
        assert_eq!(cli.seek_range(), SeekRange { start: Some(100), end: None });
        assert_eq!(cli.record_paths().len(), 2);
    }
}
