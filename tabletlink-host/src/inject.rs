use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context};

use tabletlink_proto::telegram::{InputState, Vec2, Vec3};
use tabletlink_proto::Slot;

/// Receives decoded telemetry for a slot and turns it into engine input.
pub trait InjectionSink: Send + Sync {
    fn inject(&self, slot: Slot, state: &InputState);
}

/// Fixed screen size normalized touch coordinates are scaled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceResolution {
    pub width: u32,
    pub height: u32,
}

impl Default for ReferenceResolution {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl ReferenceResolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn to_screen(&self, touch_x: f32, touch_y: f32) -> Vec2 {
        Vec2 {
            x: touch_x * self.width as f32,
            y: touch_y * self.height as f32,
        }
    }
}

impl fmt::Display for ReferenceResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ReferenceResolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (w, h) = s
            .trim()
            .split_once(|c: char| c == 'x' || c == 'X')
            .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got {:?}", s))?;
        let width: u32 = w.trim().parse().with_context(|| format!("bad width in {s:?}"))?;
        let height: u32 = h.trim().parse().with_context(|| format!("bad height in {s:?}"))?;
        if width == 0 || height == 0 {
            anyhow::bail!("resolution {s:?} has a zero dimension");
        }
        Ok(Self { width, height })
    }
}

/// Engine-facing form of one telegram: buttons become axis values and touch
/// is in pixels of the reference resolution.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InjectionSample {
    pub stick: Vec2,
    pub button_a: f32,
    pub gyro: Vec3,
    pub touch_position: Vec2,
    pub touch_press: f32,
}

fn axis(pressed: bool) -> f32 {
    if pressed {
        1.0
    } else {
        0.0
    }
}

impl InjectionSample {
    pub fn from_state(state: &InputState, resolution: ReferenceResolution) -> Self {
        Self {
            stick: state.stick,
            button_a: axis(state.button_a),
            gyro: state.gyro,
            touch_position: resolution.to_screen(state.touch_x, state.touch_y),
            touch_press: axis(state.touch_press),
        }
    }
}

/// Logs every sample. Used by the host binary when no engine is attached.
pub struct LoggingSink {
    resolution: ReferenceResolution,
}

impl LoggingSink {
    pub fn new(resolution: ReferenceResolution) -> Self {
        Self { resolution }
    }
}

impl InjectionSink for LoggingSink {
    fn inject(&self, slot: Slot, state: &InputState) {
        let sample = InjectionSample::from_state(state, self.resolution);
        log::debug!("{} -> {:?}", slot, sample);
    }
}

/// Keeps the latest sample per slot.
pub struct RecordingSink {
    resolution: ReferenceResolution,
    latest: Mutex<HashMap<Slot, InjectionSample>>,
    count: AtomicUsize,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new(ReferenceResolution::default())
    }
}

impl RecordingSink {
    pub fn new(resolution: ReferenceResolution) -> Self {
        Self {
            resolution,
            latest: Mutex::new(HashMap::new()),
            count: AtomicUsize::new(0),
        }
    }

    pub fn latest(&self, slot: Slot) -> Option<InjectionSample> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .copied()
    }

    /// Total samples injected across all slots.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Polls until at least `n` samples arrived or `timeout` elapses.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl InjectionSink for RecordingSink {
    fn inject(&self, slot: Slot, state: &InputState) {
        let sample = InjectionSample::from_state(state, self.resolution);
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot, sample);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
