//! Linux sysfs GPIO input backend.
//!
//! Pins are exported and switched to input on open and unexported again on
//! drop.  sysfs cannot enable pull-ups, so the buttons rely on the board
//! defaults (BCM 0-8 pull high at reset) or external resistors.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use klarfunk_proto::config::GpioConfig;
use klarfunk_proto::model::{ChannelId, Level, LineId};
use tracing::{debug, info, warn};

use crate::error::InputFault;
use crate::input::LineSampler;

const SYSFS_GPIO: &str = "/sys/class/gpio";
/// udev needs a moment to fix permissions on a freshly exported pin.
const EXPORT_SETTLE: Duration = Duration::from_millis(50);
const EXPORT_ATTEMPTS: u32 = 20;

pub struct SysfsGpio {
    root: PathBuf,
    lines: Vec<(LineId, u32)>,
    exported: Vec<u32>,
}

impl SysfsGpio {
    /// Export and configure every pin.  Exporting polls for udev, so the
    /// work runs on the blocking pool.
    pub async fn open(config: &GpioConfig) -> anyhow::Result<Self> {
        Self::open_in(PathBuf::from(SYSFS_GPIO), config.clone()).await
    }

    async fn open_in(root: PathBuf, config: GpioConfig) -> anyhow::Result<Self> {
        tokio::task::spawn_blocking(move || Self::open_at(&root, &config))
            .await
            .context("gpio setup task failed")?
    }

    fn open_at(root: &Path, config: &GpioConfig) -> anyhow::Result<Self> {
        let lines: Vec<(LineId, u32)> = ChannelId::all()
            .map(LineId::Channel)
            .zip(config.channel_pins.iter().copied())
            .chain(std::iter::once((LineId::Switch, config.switch_pin)))
            .map(|(line, pin)| (line, config.chip_base + pin))
            .collect();

        let mut gpio = Self {
            root: root.to_path_buf(),
            lines,
            exported: Vec::new(),
        };
        for (line, number) in gpio.lines.clone() {
            gpio.prepare(number)
                .with_context(|| format!("failed to set up gpio{} for {}", number, line))?;
        }
        info!("gpio: sysfs lines {:?}", gpio.lines);
        Ok(gpio)
    }

    fn pin_dir(&self, number: u32) -> PathBuf {
        self.root.join(format!("gpio{}", number))
    }

    fn prepare(&mut self, number: u32) -> anyhow::Result<()> {
        let dir = self.pin_dir(number);
        if !dir.exists() {
            fs::write(self.root.join("export"), number.to_string())?;
            self.exported.push(number);
            let mut ready = false;
            for _ in 0..EXPORT_ATTEMPTS {
                if dir.join("direction").exists() {
                    ready = true;
                    break;
                }
                std::thread::sleep(EXPORT_SETTLE);
            }
            if !ready {
                anyhow::bail!("{} did not appear after export", dir.display());
            }
            debug!("gpio: exported {}", number);
        }
        if let Err(e) = fs::write(dir.join("direction"), "in") {
            // Already-configured inputs may be read-only for us.
            warn!("gpio: cannot set gpio{} direction: {}", number, e);
        }
        Ok(())
    }

    fn pin_for(&self, line: LineId) -> Option<u32> {
        self.lines.iter().find(|(l, _)| *l == line).map(|(_, n)| *n)
    }
}

fn parse_value(raw: &str) -> io::Result<Level> {
    match raw.trim() {
        "0" => Ok(Level::Low),
        "1" => Ok(Level::High),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected value {:?}", other),
        )),
    }
}

impl LineSampler for SysfsGpio {
    fn read(&mut self, line: LineId) -> Result<Level, InputFault> {
        let Some(number) = self.pin_for(line) else {
            return Err(InputFault {
                line,
                source: io::Error::new(io::ErrorKind::NotFound, "line has no pin"),
            });
        };
        fs::read_to_string(self.pin_dir(number).join("value"))
            .and_then(|raw| parse_value(&raw))
            .map_err(|source| InputFault { line, source })
    }
}

impl Drop for SysfsGpio {
    fn drop(&mut self) {
        for number in self.exported.drain(..) {
            if let Err(e) = fs::write(self.root.join("unexport"), number.to_string()) {
                warn!("gpio: unexport {} failed: {}", number, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_tree(config: &GpioConfig) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let pins = config.channel_pins.iter().chain(std::iter::once(&config.switch_pin));
        for pin in pins {
            let dir = root.path().join(format!("gpio{}", config.chip_base + pin));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("direction"), "out").unwrap();
            fs::write(dir.join("value"), "1\n").unwrap();
        }
        root
    }

    #[test]
    fn test_reads_levels_with_chip_base() {
        let config = GpioConfig {
            chip_base: 512,
            ..GpioConfig::default()
        };
        let root = fake_tree(&config);
        let mut gpio = SysfsGpio::open_at(root.path(), &config).unwrap();

        let direction = fs::read_to_string(root.path().join("gpio529/direction")).unwrap();
        assert_eq!(direction, "in");

        fs::write(root.path().join("gpio529/value"), "0\n").unwrap();
        let button1 = LineId::Channel(ChannelId::new(1).unwrap());
        assert_eq!(gpio.read(button1).unwrap(), Level::Low);
        assert_eq!(gpio.read(LineId::Switch).unwrap(), Level::High);
    }

    #[test]
    fn test_bad_value_is_a_fault() {
        let config = GpioConfig::default();
        let root = fake_tree(&config);
        let mut gpio = SysfsGpio::open_at(root.path(), &config).unwrap();

        fs::write(root.path().join("gpio27/value"), "x").unwrap();
        let fault = gpio.read(LineId::Switch).unwrap_err();
        assert_eq!(fault.line, LineId::Switch);
        assert_eq!(fault.source.kind(), io::ErrorKind::InvalidData);

        fs::remove_file(root.path().join("gpio27/value")).unwrap();
        assert!(gpio.read(LineId::Switch).is_err());
    }

    #[tokio::test]
    async fn test_open_waits_for_export_without_blocking_runtime() {
        let config = GpioConfig::default();
        let root = fake_tree(&config);
        let switch_dir = root.path().join("gpio27");
        fs::remove_dir_all(&switch_dir).unwrap();

        // Stands in for udev: the pin shows up only after the export write,
        // and only if this task gets to run while open is waiting.
        let udev = tokio::spawn({
            let export = root.path().join("export");
            let switch_dir = switch_dir.clone();
            async move {
                while !export.exists() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                fs::create_dir_all(&switch_dir).unwrap();
                fs::write(switch_dir.join("value"), "0\n").unwrap();
                fs::write(switch_dir.join("direction"), "out").unwrap();
            }
        });

        let mut gpio = SysfsGpio::open_in(root.path().to_path_buf(), config)
            .await
            .unwrap();
        udev.await.unwrap();
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "27");
        assert_eq!(gpio.read(LineId::Switch).unwrap(), Level::Low);

        drop(gpio);
        assert_eq!(fs::read_to_string(root.path().join("unexport")).unwrap(), "27");
    }

    #[test]
    fn test_preexisting_pins_are_not_unexported() {
        let config = GpioConfig::default();
        let root = fake_tree(&config);
        drop(SysfsGpio::open_at(root.path(), &config).unwrap());
        assert!(!root.path().join("unexport").exists());
    }
}
