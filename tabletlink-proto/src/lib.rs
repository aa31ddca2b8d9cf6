pub mod signal;
pub mod slot;
pub mod telegram;

pub use signal::{IceCandidate, SignalKind, SignalingEnvelope};
pub use slot::{Slot, HOST_ID};
pub use telegram::{InputState, InputTelegram, TelegramError, Vec2, Vec3};
