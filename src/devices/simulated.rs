//! In-process bench: a function generator and a camera that renders a
//! droplet whose shape follows the generator's output.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::drawing::draw_filled_ellipse_mut;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::camera::{Camera, Display};
use super::instrument::Instrument;
use crate::error::{TensiometerError, TensiometerResult};
use crate::vision::Frame;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

const DROPLET_INTENSITY: u8 = 220;

/// Maps generator output to droplet geometry.
#[derive(Debug, Clone)]
pub struct DropletModel {
    pub rest_amplitude_vpp: f64,
    pub rest_frequency_hz: f64,
    pub rest_ratio: f64,
    pub ratio_per_vpp: f64,
    pub ratio_per_hz: f64,
    /// Radius of the droplet when round.
    pub radius_px: f64,
    pub lift_px_per_vpp: f64,
}

impl Default for DropletModel {
    fn default() -> Self {
        Self {
            rest_amplitude_vpp: 0.400,
            rest_frequency_hz: 40_000.0,
            rest_ratio: 1.0,
            ratio_per_vpp: 4.0,
            ratio_per_hz: 0.002,
            radius_px: 60.0,
            lift_px_per_vpp: 400.0,
        }
    }
}

impl DropletModel {
    /// Width over height of the droplet for the given generator output.
    pub fn aspect_ratio(&self, amplitude_vpp: f64, frequency_hz: f64) -> f64 {
        let ratio = self.rest_ratio
            + self.ratio_per_vpp * (amplitude_vpp - self.rest_amplitude_vpp)
            + self.ratio_per_hz * (frequency_hz - self.rest_frequency_hz);
        ratio.clamp(0.5, 2.5)
    }
}

#[derive(Debug, Clone)]
pub struct BenchState {
    pub amplitude_vpp: f64,
    pub frequency_hz: f64,
    /// Every command written to the generator, in order.
    pub commands: Vec<String>,
    pub link_up: bool,
    pub camera_connected: bool,
}

impl BenchState {
    pub fn new(model: &DropletModel) -> Self {
        Self {
            amplitude_vpp: model.rest_amplitude_vpp,
            frequency_hz: model.rest_frequency_hz,
            commands: Vec::new(),
            link_up: true,
            camera_connected: true,
        }
    }

    pub fn shared(self) -> SharedBench {
        Arc::new(Mutex::new(self))
    }
}

pub type SharedBench = Arc<Mutex<BenchState>>;

fn lock_bench(bench: &SharedBench) -> MutexGuard<'_, BenchState> {
    bench.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SimulatedInstrument {
    bench: SharedBench,
    command_delay: Duration,
}

impl SimulatedInstrument {
    pub fn new(bench: SharedBench) -> Self {
        Self {
            bench,
            command_delay: Duration::ZERO,
        }
    }

    /// Bus time spent on every write.
    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }
}

fn parse_argument(command: &str, argument: &str) -> TensiometerResult<f64> {
    argument
        .trim()
        .parse::<f64>()
        .map_err(|_| TensiometerError::MalformedResponse {
            command: command.to_string(),
            response: argument.to_string(),
        })
}

impl Instrument for SimulatedInstrument {
    fn write_command(&mut self, command: &str) -> TensiometerResult<()> {
        if !self.command_delay.is_zero() {
            std::thread::sleep(self.command_delay);
        }
        let mut bench = lock_bench(&self.bench);
        if !bench.link_up {
            return Err(TensiometerError::DeviceUnavailable("GPIB link down".into()));
        }
        bench.commands.push(command.to_string());

        if let Some(rest) = command.strip_prefix("voltage ") {
            if let Some(value) = rest.strip_suffix(" VPP") {
                bench.amplitude_vpp = parse_argument(command, value)?;
            }
        } else if let Some(value) = command.strip_prefix("frequency ") {
            bench.frequency_hz = parse_argument(command, value)?;
        } else if command != "system:beep" && !command.ends_with('?') {
            log_warn!("simulated generator ignored '{command}'");
        }
        Ok(())
    }

    fn send_command(&mut self, command: &str) -> TensiometerResult<String> {
        self.write_command(command)?;
        let bench = lock_bench(&self.bench);
        let reply = match command {
            "frequency?" => format!("{:+.8E}", bench.frequency_hz),
            "voltage?" => format!("{:+.8E}", bench.amplitude_vpp),
            _ => String::new(),
        };
        Ok(reply)
    }
}

pub struct SimulatedCamera {
    bench: SharedBench,
    model: DropletModel,
    width: u32,
    height: u32,
    frame_interval: Duration,
    noise: u8,
    rng: StdRng,
    opened: bool,
}

impl SimulatedCamera {
    pub fn new(bench: SharedBench, model: DropletModel, width: u32, height: u32) -> Self {
        Self {
            bench,
            model,
            width,
            height,
            frame_interval: Duration::from_millis(10),
            noise: 0,
            rng: StdRng::seed_from_u64(7),
            opened: false,
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Adds up to `noise` grey levels of uniform sensor noise per pixel.
    pub fn with_noise(mut self, noise: u8) -> Self {
        self.noise = noise;
        self
    }

    fn render(&mut self) -> GrayImage {
        let (amplitude, frequency) = {
            let bench = lock_bench(&self.bench);
            (bench.amplitude_vpp, bench.frequency_hz)
        };
        let ratio = self.model.aspect_ratio(amplitude, frequency);
        let width_radius = (self.model.radius_px * ratio.sqrt()).round() as i32;
        let height_radius = (self.model.radius_px / ratio.sqrt()).round() as i32;
        let lift = self.model.lift_px_per_vpp * (amplitude - self.model.rest_amplitude_vpp);
        let center = (
            self.width as i32 / 2,
            (self.height as f64 / 2.0 - lift).round() as i32,
        );

        let mut image = GrayImage::new(self.width, self.height);
        draw_filled_ellipse_mut(
            &mut image,
            center,
            width_radius,
            height_radius,
            Luma([DROPLET_INTENSITY]),
        );

        if self.noise > 0 {
            for pixel in image.pixels_mut() {
                let jitter = self.rng.gen_range(0..=self.noise);
                pixel.0[0] = pixel.0[0].saturating_add(jitter);
            }
        }
        image
    }
}

impl Camera for SimulatedCamera {
    fn open(&mut self) -> bool {
        self.opened = lock_bench(&self.bench).camera_connected;
        self.opened
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn grab(&mut self) -> bool {
        if !self.opened {
            return false;
        }
        if !lock_bench(&self.bench).camera_connected {
            self.opened = false;
            return false;
        }
        std::thread::sleep(self.frame_interval);
        true
    }

    fn read(&mut self) -> Option<DynamicImage> {
        if !self.opened {
            return None;
        }
        Some(DynamicImage::ImageLuma8(self.render()))
    }
}

/// What a [`SimulatedDisplay`] was asked to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedFrame {
    pub seq: u64,
    pub channels: u8,
}

pub struct SimulatedDisplay {
    viewport: Arc<Mutex<(u32, u32)>>,
    rendered: Arc<Mutex<Vec<RenderedFrame>>>,
}

impl SimulatedDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            viewport: Arc::new(Mutex::new((width, height))),
            rendered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of rendered frames, readable after the display is moved
    /// into the acquisition loop.
    pub fn rendered(&self) -> Arc<Mutex<Vec<RenderedFrame>>> {
        Arc::clone(&self.rendered)
    }

    /// Handle for resizing the viewport from outside.
    pub fn viewport_handle(&self) -> Arc<Mutex<(u32, u32)>> {
        Arc::clone(&self.viewport)
    }
}

impl Display for SimulatedDisplay {
    fn viewport(&self) -> (u32, u32) {
        *self
            .viewport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn render(&mut self, frame: &Frame) {
        self.rendered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RenderedFrame {
                seq: frame.seq,
                channels: frame.channels(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Phase;
    use crate::devices::FunctionGenerator;
    use crate::settings::VisionSettings;
    use crate::vision::DropletAnalyzer;

    fn bench() -> (SharedBench, DropletModel) {
        let model = DropletModel::default();
        (BenchState::new(&model).shared(), model)
    }

    #[test]
    fn generator_commands_move_the_bench() {
        let (bench, _) = bench();
        let mut fg = FunctionGenerator::new(Box::new(SimulatedInstrument::new(Arc::clone(&bench))));

        fg.set_amplitude(0.45).unwrap();
        fg.set_frequency(40_010.0).unwrap();

        assert_eq!(fg.amplitude().unwrap(), 0.45);
        assert_eq!(fg.frequency().unwrap(), 40_010.0);
        assert_eq!(lock_bench(&bench).commands[0], "voltage 0.45 VPP");
    }

    #[test]
    fn link_loss_is_reported_as_unavailable() {
        let (bench, _) = bench();
        lock_bench(&bench).link_up = false;
        let mut fg = FunctionGenerator::new(Box::new(SimulatedInstrument::new(bench)));

        assert!(matches!(
            fg.set_amplitude(0.41),
            Err(TensiometerError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn rendered_droplet_tracks_the_model_ratio() {
        let (bench, model) = bench();
        lock_bench(&bench).amplitude_vpp = 0.45;
        let expected = model.aspect_ratio(0.45, model.rest_frequency_hz);

        let mut camera = SimulatedCamera::new(Arc::clone(&bench), model, 320, 240)
            .with_frame_interval(Duration::ZERO);
        assert!(camera.open());
        assert!(camera.grab());
        let frame = Frame::new(1, camera.read().unwrap());

        let mut analyzer = DropletAnalyzer::new(&VisionSettings::default()).unwrap();
        let ratio = analyzer
            .measure_for_feedback(&frame, Phase::Compressing)
            .unwrap();
        assert!((ratio - expected).abs() < 0.1, "ratio {ratio} vs {expected}");
    }

    #[test]
    fn unplugged_camera_stops_grabbing() {
        let (bench, model) = bench();
        let mut camera =
            SimulatedCamera::new(Arc::clone(&bench), model, 64, 64).with_frame_interval(Duration::ZERO);
        assert!(camera.open());

        lock_bench(&bench).camera_connected = false;

        assert!(!camera.grab());
        assert!(!camera.is_opened());
    }
}
