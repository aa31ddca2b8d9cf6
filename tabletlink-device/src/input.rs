use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tabletlink_proto::telegram::{InputState, Vec2, Vec3};

/// Where the sampling loop reads the current controls from.
pub trait InputSource: Send + Sync {
    fn sample(&self) -> InputState;
}

/// Latest-wins cell an embedding application writes into.
#[derive(Default)]
pub struct SharedInput {
    state: Mutex<InputState>,
}

impl SharedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: InputState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn update(&self, f: impl FnOnce(&mut InputState)) {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Records a touch or pointer position given in screen pixels.
    pub fn set_pointer(&self, x: f32, y: f32, screen_width: f32, screen_height: f32, pressed: bool) {
        let normalize = |v: f32, extent: f32| {
            if extent > 0.0 {
                (v / extent).clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        self.update(|s| {
            s.touch_x = normalize(x, screen_width);
            s.touch_y = normalize(y, screen_height);
            s.touch_press = pressed;
        });
    }
}

impl InputSource for SharedInput {
    fn sample(&self) -> InputState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deterministic sweep for demos: the stick and touch point circle once
/// every `period` and button A is held for the first half of each turn.
pub struct SyntheticInput {
    started: Instant,
    period: Duration,
}

impl Default for SyntheticInput {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl SyntheticInput {
    pub fn new(period: Duration) -> Self {
        Self {
            started: Instant::now(),
            period,
        }
    }

    /// The state `elapsed` into the sweep.
    pub fn at(&self, elapsed: Duration) -> InputState {
        let period = self.period.as_secs_f32().max(f32::EPSILON);
        let phase = (elapsed.as_secs_f32() % period) / period;
        let angle = phase * std::f32::consts::TAU;
        let (sin, cos) = angle.sin_cos();
        let held = phase < 0.5;
        InputState {
            stick: Vec2 { x: cos, y: sin },
            button_a: held,
            gyro: Vec3 {
                x: 0.0,
                y: 9.8,
                z: 0.0,
            },
            touch_x: 0.5 + 0.4 * cos,
            touch_y: 0.5 + 0.4 * sin,
            touch_press: held,
        }
    }
}

impl InputSource for SyntheticInput {
    fn sample(&self) -> InputState {
        self.at(self.started.elapsed())
    }
}
