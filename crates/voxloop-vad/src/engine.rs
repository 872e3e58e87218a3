use thiserror::Error;

use crate::config::VadConfig;
use crate::energy;
use crate::floor::NoiseFloor;
use crate::state::VadStateMachine;
use crate::types::{VadEvent, VadState};

#[derive(Debug, Error)]
pub enum VadError {
    #[error("window has {got} samples, engine requires {want}")]
    WindowSize { got: usize, want: usize },
}

/// A voice-activity detector processing fixed-size PCM16 windows.
///
/// Implementations are interchangeable in the gate stage; the engine only
/// sees windows of exactly `window_size_samples()` samples.
pub trait VadEngine: Send {
    fn process(&mut self, window: &[i16]) -> Result<Option<VadEvent>, VadError>;
    fn reset(&mut self);
    fn state(&self) -> VadState;
    fn window_size_samples(&self) -> usize;
    fn sample_rate_hz(&self) -> u32;
}

/// Energy-based detector: adaptive noise floor plus hysteresis.
pub struct EnergyVad {
    config: VadConfig,
    floor: NoiseFloor,
    machine: VadStateMachine,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        let floor = NoiseFloor::new(config.initial_floor_db, config.floor_alpha);
        let machine = VadStateMachine::new(&config);
        Self {
            config,
            floor,
            machine,
        }
    }

    fn classify(&mut self, level_db: f32) -> bool {
        let floor = self.floor.floor_db();
        let active = match self.machine.state() {
            VadState::Silence => level_db > floor + self.config.onset_db,
            // Inside speech a window only counts as silence once it drops
            // below the lower offset threshold.
            VadState::Speech => level_db > floor + self.config.offset_db,
        };
        if !active {
            self.floor.adapt(level_db);
        }
        active
    }
}

impl VadEngine for EnergyVad {
    fn process(&mut self, window: &[i16]) -> Result<Option<VadEvent>, VadError> {
        if window.len() != self.config.window_size_samples {
            return Err(VadError::WindowSize {
                got: window.len(),
                want: self.config.window_size_samples,
            });
        }
        let level_db = energy::dbfs(window);
        let active = self.classify(level_db);
        Ok(self.machine.advance(active))
    }

    fn reset(&mut self) {
        self.floor.reset(self.config.initial_floor_db);
        self.machine.reset();
    }

    fn state(&self) -> VadState {
        self.machine.state()
    }

    fn window_size_samples(&self) -> usize {
        self.config.window_size_samples
    }

    fn sample_rate_hz(&self) -> u32 {
        self.config.sample_rate_hz
    }
}
