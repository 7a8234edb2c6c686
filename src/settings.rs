use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// Gains and setpoint of the aspect-ratio controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PidSettings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
}

impl Default for PidSettings {
    fn default() -> Self {
        Self {
            kp: 1.0,
            ki: 0.0,
            kd: 5.0,
            setpoint: 1.2,
        }
    }
}

/// Open-loop compress/relax ramp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepSettings {
    pub min_amplitude_vpp: f64,
    pub max_amplitude_vpp: f64,
    pub step_vpp: f64,
    /// How often instrument frequency/amplitude is forwarded to observers during a sweep
    pub telemetry_interval_ms: u64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            min_amplitude_vpp: 0.400,
            max_amplitude_vpp: 0.475,
            step_vpp: 1e-5,
            telemetry_interval_ms: 250,
        }
    }
}

/// Multi-run elasticity study.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElasticitySettings {
    /// Repeats after the initial characterisation run
    pub runs: u32,
    pub amplitude_step_vpp: f64,
    pub aspect_ratio_limit: f64,
    /// Compression never drives the amplitude above this.
    pub max_amplitude_vpp: f64,
    pub settle_secs: u64,
}

impl Default for ElasticitySettings {
    fn default() -> Self {
        Self {
            runs: 11,
            amplitude_step_vpp: 0.005,
            aspect_ratio_limit: 1.3,
            max_amplitude_vpp: 0.750,
            settle_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionSettings {
    /// Pixel distances are divided by this to obtain microns.
    pub calibration_constant: f64,
    /// Pixels at or below this intensity are zeroed after edge enhancement.
    pub threshold: u8,
    /// Acoustic node height above the bottom of the field of view, microns.
    pub node_location_um: f64,
    /// Added to every converted height (e.g. horn-to-frame distance).
    pub reference_offset_um: f64,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            calibration_constant: 0.81915 / 129.67,
            threshold: 25,
            node_location_um: 1718.0,
            reference_offset_um: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraSettings {
    pub index: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            index: 0,
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentSettings {
    pub gpib_address: u8,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self { gpib_address: 10 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TensiometerSettings {
    pub pid: PidSettings,
    pub sweep: SweepSettings,
    pub elasticity: ElasticitySettings,
    pub vision: VisionSettings,
    pub camera: CameraSettings,
    pub instrument: InstrumentSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<TensiometerSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(err) => {
                    log::warn!(
                        "Settings at {} are unreadable ({err}); using defaults",
                        path.display()
                    );
                    TensiometerSettings::default()
                }
            }
        } else {
            TensiometerSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn snapshot(&self) -> TensiometerSettings {
        self.read().clone()
    }

    pub fn pid(&self) -> PidSettings {
        self.read().pid
    }

    pub fn sweep(&self) -> SweepSettings {
        self.read().sweep.clone()
    }

    pub fn elasticity(&self) -> ElasticitySettings {
        self.read().elasticity.clone()
    }

    pub fn vision(&self) -> VisionSettings {
        self.read().vision.clone()
    }

    pub fn camera(&self) -> CameraSettings {
        self.read().camera.clone()
    }

    pub fn instrument(&self) -> InstrumentSettings {
        self.read().instrument.clone()
    }

    pub fn update_pid_gains(&self, kp: f64, ki: f64, kd: f64) -> Result<PidSettings> {
        let mut guard = self.write();
        guard.pid.kp = kp;
        guard.pid.ki = ki;
        guard.pid.kd = kd;
        self.persist(&guard)?;
        Ok(guard.pid)
    }

    pub fn update_setpoint(&self, setpoint: f64) -> Result<PidSettings> {
        let mut guard = self.write();
        guard.pid.setpoint = setpoint;
        self.persist(&guard)?;
        Ok(guard.pid)
    }

    pub fn update_sweep(&self, sweep: SweepSettings) -> Result<()> {
        let mut guard = self.write();
        guard.sweep = sweep;
        self.persist(&guard)
    }

    pub fn update_elasticity(&self, elasticity: ElasticitySettings) -> Result<()> {
        let mut guard = self.write();
        guard.elasticity = elasticity;
        self.persist(&guard)
    }

    fn read(&self) -> RwLockReadGuard<'_, TensiometerSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TensiometerSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &TensiometerSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_apparatus_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();

        let pid = store.pid();
        assert_eq!(pid.kp, 1.0);
        assert_eq!(pid.ki, 0.0);
        assert_eq!(pid.kd, 5.0);
        assert_eq!(store.sweep().step_vpp, 1e-5);
        assert_eq!(store.elasticity().runs, 11);
        assert_eq!(store.vision().threshold, 25);
    }

    #[test]
    fn gain_updates_are_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        store.update_pid_gains(2.0, 0.5, 0.1).unwrap();
        store.update_setpoint(1.1).unwrap();

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(
            reopened.pid(),
            PidSettings {
                kp: 2.0,
                ki: 0.5,
                kd: 0.1,
                setpoint: 1.1
            }
        );
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.snapshot(), TensiometerSettings::default());
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"pid": {"kp": 3.0, "ki": 0.0, "kd": 0.0, "setpoint": 0.9}}"#,
        )
        .unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.pid().kp, 3.0);
        assert_eq!(store.sweep(), SweepSettings::default());
    }
}
