//! Fault taxonomy for the runtime.
//!
//! Faults are split the way recovery is split: interface faults unwind to the
//! life-cycle loop, component faults are absorbed by the phase that raised
//! them, and usage faults are never recovered. Session/experiment exits are
//! not faults at all; see [`crate::machine::Signal`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Communication or driver failure on a hardware interface.
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("{device}: {message}")]
    Communication { device: String, message: String },

    #[error("{device}: channel {channel} is not configured")]
    UnknownChannel { device: String, channel: u32 },

    #[error("{device}: audio source {path:?} could not be queued")]
    Audio { device: String, path: PathBuf },

    #[error("{device}: interface is closed")]
    Closed { device: String },
}

impl InterfaceError {
    pub fn communication(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// A physical component is in a state it should not be in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error("hopper was already up before the feed")]
    HopperAlreadyUp,

    #[error("hopper did not come up")]
    HopperWontComeUp,

    #[error("hopper did not drop")]
    HopperWontDrop,

    #[error("hopper is up but the solenoid is inactive")]
    HopperActive,

    #[error("hopper is down but the solenoid is active")]
    HopperInactive,

    #[error("{component}: {message}")]
    Other { component: String, message: String },
}

impl ComponentError {
    /// Short tag stored on the trial (`reward = "error:<tag>"`).
    pub fn tag(&self) -> &str {
        match self {
            Self::HopperAlreadyUp => "hopper_already_up",
            Self::HopperWontComeUp => "hopper_wont_come_up",
            Self::HopperWontDrop => "hopper_wont_drop",
            Self::HopperActive => "hopper_active",
            Self::HopperInactive => "hopper_inactive",
            Self::Other { component, .. } => component.as_str(),
        }
    }
}

/// Either kind of hardware fault, as returned by components.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Component(#[from] ComponentError),
}

/// Programmer or configuration errors. Never swallowed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UsageError {
    #[error("{queue}: next() called before update() for the previous trial")]
    NotUpdated { queue: String },

    #[error("{queue}: update() called without a preceding next()")]
    UpdateWithoutNext { queue: String },

    #[error("state machine has no state named {0}")]
    UnknownState(String),

    #[error("selection refers to condition {index} but the block has {len}")]
    ConditionOutOfRange { index: usize, len: usize },

    #[error("condition {condition}: stimulus index {index} out of range ({len} items)")]
    StimulusOutOfRange {
        condition: String,
        index: usize,
        len: usize,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Configuration rejected during validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: {message}")]
    Invalid { field: String, message: String },

    #[error("invalid time of day {0:?} (expected HH:MM)")]
    TimeOfDay(String),

    #[error("failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data store io: {0}")]
    Io(#[from] io::Error),

    #[error("data store encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("snapshot has bad magic")]
    BadMagic,

    #[error("unsupported snapshot version {0}")]
    Version(u32),

    #[error("snapshot is missing the {0} chunk")]
    MissingChunk(&'static str),

    #[error("snapshot does not match the configured queues: {0}")]
    Mismatch(String),
}

/// Broad classes used by recovery decisions and fault logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Interface,
    Component,
    Usage,
    Config,
    Storage,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interface => "interface",
            Self::Component => "component",
            Self::Usage => "usage",
            Self::Config => "config",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("interface fault: {0}")]
    Interface(#[from] InterfaceError),

    #[error("component fault: {0}")]
    Component(#[from] ComponentError),

    #[error("usage fault: {0}")]
    Usage(#[from] UsageError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl From<HardwareError> for Error {
    fn from(e: HardwareError) -> Self {
        match e {
            HardwareError::Interface(e) => Self::Interface(e),
            HardwareError::Component(e) => Self::Component(e),
        }
    }
}

impl Error {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::Interface(_) => FaultKind::Interface,
            Self::Component(_) => FaultKind::Component,
            Self::Usage(_) => FaultKind::Usage,
            Self::Config(_) => FaultKind::Config,
            Self::Store(_) | Self::Snapshot(_) => FaultKind::Storage,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
