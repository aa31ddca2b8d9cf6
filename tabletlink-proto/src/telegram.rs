use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Telegrams are a few hundred bytes; anything larger is not ours.
pub const MAX_TELEGRAM_LEN: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One sample of a handheld's controls. Touch coordinates are normalized
/// to `[0, 1]` of the device screen.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputState {
    pub stick: Vec2,
    pub button_a: bool,
    pub gyro: Vec3,
    pub touch_x: f32,
    pub touch_y: f32,
    pub touch_press: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputTelegram {
    pub player_id: i32,
    pub data: InputState,
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram of {0} bytes exceeds max {MAX_TELEGRAM_LEN}")]
    TooLarge(usize),
    #[error("malformed telegram: {0}")]
    Malformed(#[from] serde_json::Error),
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

impl InputState {
    /// Replaces non-finite values with zero and clamps touch into `[0, 1]`.
    ///
    /// JSON has no encoding for NaN, so an unsanitized sample would be
    /// written as `null` and rejected by the decoder.
    pub fn sanitized(self) -> Self {
        Self {
            stick: Vec2 {
                x: finite_or_zero(self.stick.x),
                y: finite_or_zero(self.stick.y),
            },
            button_a: self.button_a,
            gyro: Vec3 {
                x: finite_or_zero(self.gyro.x),
                y: finite_or_zero(self.gyro.y),
                z: finite_or_zero(self.gyro.z),
            },
            touch_x: finite_or_zero(self.touch_x).clamp(0.0, 1.0),
            touch_y: finite_or_zero(self.touch_y).clamp(0.0, 1.0),
            touch_press: self.touch_press,
        }
    }
}

impl InputTelegram {
    pub fn new(player_id: i32, data: InputState) -> Self {
        Self { player_id, data }
    }

    pub fn encode(&self) -> Result<String, TelegramError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TelegramError> {
        if bytes.len() > MAX_TELEGRAM_LEN {
            return Err(TelegramError::TooLarge(bytes.len()));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
