mod config;
mod inject;
mod orchestrator;

pub use config::{HostConfig, DEFAULT_RELAY_URL};
pub use inject::{
    InjectionSample, InjectionSink, LoggingSink, RecordingSink, ReferenceResolution,
};
pub use orchestrator::{Orchestrator, SlotStatus, INPUT_CHANNEL};
