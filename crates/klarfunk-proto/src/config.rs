use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::model::{Channel, ChannelId, CHANNEL_COUNT};
use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub announcements: AnnouncementsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
    /// Directory of the loaded config file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,
    pub announcement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// mpv `--ao` value, e.g. "pipewire", "pulse", "alsa".  "auto" leaves
    /// the choice to mpv.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_device")]
    pub device: String,
    /// Output volume, 0..=100.
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default)]
    pub buffer: BufferConfig,
}

/// Stream buffering passed through to mpv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_secs")]
    pub cache_secs: f64,
    #[serde(default = "default_demuxer_max_bytes")]
    pub demuxer_max_bytes: String,
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioConfig {
    /// BCM pin numbers of the five channel buttons, in channel order.
    #[serde(default = "default_channel_pins")]
    pub channel_pins: Vec<u32>,
    #[serde(default = "default_switch_pin")]
    pub switch_pin: u32,
    /// Base number of the GPIO chip in sysfs (512 on recent Pi kernels).
    #[serde(default)]
    pub chip_base: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_long_press_ms")]
    pub long_press_ms: u64,
    /// Channel button whose long-press requests a system shutdown.
    #[serde(default = "default_shutdown_button")]
    pub shutdown_button: u8,
    #[serde(default)]
    pub invert_switch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: f64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: f64,
    #[serde(default = "default_stall_secs")]
    pub stall_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_check_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_check_port")]
    pub port: u16,
    #[serde(default = "default_check_timeout_secs")]
    pub timeout_secs: f64,
}

/// Whether the stream connection waits for the channel announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sequencing {
    /// Connect only after the announcement has finished.
    #[default]
    Before,
    /// Queue the stream behind the announcement so it connects meanwhile.
    Preload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncementsConfig {
    #[serde(default = "default_audio_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_announcement_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub sequencing: Sequencing,
    #[serde(default = "default_startup_branding")]
    pub startup_branding: String,
    #[serde(default = "default_boot_connected")]
    pub boot_connected: String,
    #[serde(default = "default_boot_no_internet")]
    pub boot_no_internet: String,
    #[serde(default = "default_selector_off")]
    pub selector_off: String,
    #[serde(default = "default_power_on")]
    pub power_on: String,
    #[serde(default = "default_goodbye")]
    pub goodbye: String,
    #[serde(default = "default_shutdown")]
    pub shutdown: String,
    #[serde(default = "default_retrying")]
    pub retrying: String,
    #[serde(default = "default_failed")]
    pub failed: String,
    #[serde(default = "default_no_internet")]
    pub no_internet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_command")]
    pub command: Vec<String>,
}

/// Announcement clips with every path resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementClips {
    pub startup_branding: PathBuf,
    pub boot_connected: PathBuf,
    pub boot_no_internet: PathBuf,
    pub selector_off: PathBuf,
    pub power_on: PathBuf,
    pub goodbye: PathBuf,
    pub shutdown: PathBuf,
    pub retrying: PathBuf,
    pub failed: PathBuf,
    pub no_internet: PathBuf,
}

impl AnnouncementClips {
    /// Name/path pairs, used for startup diagnostics.
    pub fn entries(&self) -> [(&'static str, &Path); 10] {
        [
            ("startup_branding", &self.startup_branding),
            ("boot_connected", &self.boot_connected),
            ("boot_no_internet", &self.boot_no_internet),
            ("selector_off", &self.selector_off),
            ("power_on", &self.power_on),
            ("goodbye", &self.goodbye),
            ("shutdown", &self.shutdown),
            ("retrying", &self.retrying),
            ("failed", &self.failed),
            ("no_internet", &self.no_internet),
        ]
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            device: default_device(),
            volume: default_volume(),
            buffer: BufferConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_secs: default_cache_secs(),
            demuxer_max_bytes: default_demuxer_max_bytes(),
            network_timeout_secs: default_network_timeout_secs(),
        }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            channel_pins: default_channel_pins(),
            switch_pin: default_switch_pin(),
            chip_base: 0,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            debounce_ms: default_debounce_ms(),
            long_press_ms: default_long_press_ms(),
            shutdown_button: default_shutdown_button(),
            invert_switch: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_retry_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval_secs(),
            stall_secs: default_stall_secs(),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hosts: default_check_hosts(),
            port: default_check_port(),
            timeout_secs: default_check_timeout_secs(),
        }
    }
}

impl Default for AnnouncementsConfig {
    fn default() -> Self {
        Self {
            dir: default_audio_dir(),
            timeout_secs: default_announcement_timeout_secs(),
            sequencing: Sequencing::default(),
            startup_branding: default_startup_branding(),
            boot_connected: default_boot_connected(),
            boot_no_internet: default_boot_no_internet(),
            selector_off: default_selector_off(),
            power_on: default_power_on(),
            goodbye: default_goodbye(),
            shutdown: default_shutdown(),
            retrying: default_retrying(),
            failed: default_failed(),
            no_internet: default_no_internet(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            command: default_shutdown_command(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_backend() -> String {
    "auto".to_string()
}

fn default_device() -> String {
    "default".to_string()
}

fn default_volume() -> u8 {
    80
}

fn default_cache_secs() -> f64 {
    8.0
}

fn default_demuxer_max_bytes() -> String {
    "32MiB".to_string()
}

fn default_network_timeout_secs() -> f64 {
    10.0
}

fn default_channel_pins() -> Vec<u32> {
    vec![17, 22, 23, 24, 25]
}

fn default_switch_pin() -> u32 {
    27
}

fn default_sample_interval_ms() -> u64 {
    10
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_long_press_ms() -> u64 {
    5_000
}

fn default_shutdown_button() -> u8 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> f64 {
    5.0
}

fn default_connect_timeout_secs() -> f64 {
    10.0
}

fn default_check_interval_secs() -> f64 {
    5.0
}

fn default_stall_secs() -> f64 {
    20.0
}

fn default_check_hosts() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

fn default_check_port() -> u16 {
    53
}

fn default_check_timeout_secs() -> f64 {
    2.0
}

fn default_audio_dir() -> PathBuf {
    PathBuf::from("audio")
}

fn default_announcement_timeout_secs() -> f64 {
    15.0
}

fn default_startup_branding() -> String {
    "startup_branding.mp3".to_string()
}

fn default_boot_connected() -> String {
    "boot_connected.mp3".to_string()
}

fn default_boot_no_internet() -> String {
    "boot_no_internet.mp3".to_string()
}

fn default_selector_off() -> String {
    "selector_off.mp3".to_string()
}

fn default_power_on() -> String {
    "power_on.mp3".to_string()
}

fn default_goodbye() -> String {
    "goodbye.mp3".to_string()
}

fn default_shutdown() -> String {
    "shutdown.mp3".to_string()
}

fn default_retrying() -> String {
    "error_retrying.mp3".to_string()
}

fn default_failed() -> String {
    "error_failed.mp3".to_string()
}

fn default_no_internet() -> String {
    "error_no_internet.mp3".to_string()
}

fn default_shutdown_command() -> Vec<String> {
    ["sudo", "shutdown", "-h", "now"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Longest duration any setting may ask for.
const MAX_SECS: f64 = 24.0 * 60.0 * 60.0;

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl InputConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn long_press(&self) -> Duration {
        Duration::from_millis(self.long_press_ms)
    }

    pub fn shutdown_channel(&self) -> Option<ChannelId> {
        ChannelId::new(self.shutdown_button)
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        secs(self.delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        secs(self.check_interval_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        secs(self.stall_secs)
    }
}

impl ConnectivityConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }
}

impl AnnouncementsConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }
}

impl Config {
    /// Load and validate the config at `path`.  There is no sensible default
    /// for the channels, so a missing file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found: {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("At least one channel must be configured");
        }
        if self.channels.len() > usize::from(CHANNEL_COUNT) {
            bail!(
                "{} channels configured, the panel only has {} buttons",
                self.channels.len(),
                CHANNEL_COUNT
            );
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.url.trim().is_empty() {
                bail!("channel {} ({}) has an empty url", i + 1, ch.name);
            }
        }
        if self.audio.volume > 100 {
            bail!("audio.volume must be between 0 and 100");
        }
        if self.gpio.channel_pins.len() != usize::from(CHANNEL_COUNT) {
            bail!("gpio.channel_pins must list exactly {} pins", CHANNEL_COUNT);
        }
        if self.input.shutdown_channel().is_none() {
            bail!(
                "input.shutdown_button must be between 1 and {}",
                CHANNEL_COUNT
            );
        }
        if self.input.sample_interval_ms == 0 {
            bail!("input.sample_interval_ms must be positive");
        }
        if self.input.long_press_ms <= self.input.debounce_ms {
            bail!("input.long_press_ms must exceed input.debounce_ms");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        let positive = [
            ("retry.connect_timeout_secs", self.retry.connect_timeout_secs),
            ("watchdog.check_interval_secs", self.watchdog.check_interval_secs),
            ("watchdog.stall_secs", self.watchdog.stall_secs),
            ("connectivity.timeout_secs", self.connectivity.timeout_secs),
            ("announcements.timeout_secs", self.announcements.timeout_secs),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value <= MAX_SECS) {
                bail!("{} must be positive and at most {} seconds", name, MAX_SECS);
            }
        }
        if !(0.0..=MAX_SECS).contains(&self.retry.delay_secs) {
            bail!("retry.delay_secs must be between 0 and {} seconds", MAX_SECS);
        }
        if self.connectivity.enabled && self.connectivity.hosts.is_empty() {
            bail!("connectivity.hosts must not be empty when the check is enabled");
        }
        Ok(())
    }

    /// Directory the announcement clips live in.
    pub fn audio_dir(&self) -> PathBuf {
        let dir = &self.announcements.dir;
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.base_dir.join(dir)
        }
    }

    fn clip(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.audio_dir().join(path)
        }
    }

    pub fn channel_list(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .zip(ChannelId::all())
            .map(|(ch, id)| Channel {
                id,
                name: ch.name.clone(),
                stream_url: ch.url.clone(),
                announcement: self.clip(&ch.announcement),
            })
            .collect()
    }

    pub fn clips(&self) -> AnnouncementClips {
        let a = &self.announcements;
        AnnouncementClips {
            startup_branding: self.clip(&a.startup_branding),
            boot_connected: self.clip(&a.boot_connected),
            boot_no_internet: self.clip(&a.boot_no_internet),
            selector_off: self.clip(&a.selector_off),
            power_on: self.clip(&a.power_on),
            goodbye: self.clip(&a.goodbye),
            shutdown: self.clip(&a.shutdown),
            retrying: self.clip(&a.retrying),
            failed: self.clip(&a.failed),
            no_internet: self.clip(&a.no_internet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[channel]]
name = "Deutschlandfunk"
url = "https://st01.sslstream.dlf.de/dlf/01/128/mp3/stream.mp3"
announcement = "channel_1.mp3"

[[channel]]
name = "WDR 4"
url = "https://wdr-wdr4-live.icecastssl.wdr.de/wdr/wdr4/live/mp3/128/stream.mp3"
announcement = "/opt/klarfunk/wdr4.mp3"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.audio.volume, 80);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.input.long_press(), Duration::from_secs(5));
        assert_eq!(config.announcements.timeout(), Duration::from_secs(15));
        assert_eq!(config.announcements.sequencing, Sequencing::Before);
        assert_eq!(config.gpio.channel_pins, vec![17, 22, 23, 24, 25]);
        assert_eq!(config.shutdown.command[0], "sudo");
    }

    #[test]
    fn test_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        let channels = config.channel_list();
        assert_eq!(channels[0].id, ChannelId::new(1).unwrap());
        assert_eq!(
            channels[0].announcement,
            dir.path().join("audio").join("channel_1.mp3")
        );
        assert_eq!(channels[1].announcement, PathBuf::from("/opt/klarfunk/wdr4.mp3"));
        assert_eq!(
            config.clips().goodbye,
            dir.path().join("audio").join("goodbye.mp3")
        );
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Config::from_toml_str("").is_err());

        let too_loud = format!("{}\n[audio]\nvolume = 120\n", MINIMAL);
        assert!(Config::from_toml_str(&too_loud).is_err());

        let no_retries = format!("{}\n[retry]\nmax_attempts = 0\n", MINIMAL);
        assert!(Config::from_toml_str(&no_retries).is_err());

        let bad_button = format!("{}\n[input]\nshutdown_button = 7\n", MINIMAL);
        assert!(Config::from_toml_str(&bad_button).is_err());
    }

    #[test]
    fn test_rejects_unbounded_durations() {
        for section in [
            "[retry]\ndelay_secs = inf",
            "[retry]\ndelay_secs = nan",
            "[retry]\nconnect_timeout_secs = 1e300",
            "[watchdog]\nstall_secs = inf",
            "[connectivity]\ntimeout_secs = -1.0",
        ] {
            let toml = format!("{}\n{}\n", MINIMAL, section);
            assert!(Config::from_toml_str(&toml).is_err(), "accepted {}", section);
        }

        let slow = format!("{}\n[retry]\ndelay_secs = 600.0\n", MINIMAL);
        let config = Config::from_toml_str(&slow).unwrap();
        assert_eq!(config.retry.delay(), Duration::from_secs(600));
    }

    #[test]
    fn test_sequencing_parses() {
        let preload = format!("{}\n[announcements]\nsequencing = \"preload\"\n", MINIMAL);
        let config = Config::from_toml_str(&preload).unwrap();
        assert_eq!(config.announcements.sequencing, Sequencing::Preload);
    }
}
