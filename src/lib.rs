//! Operant-conditioning experiment runtime.
//!
//! An [`Experiment`] drives a panel of peck ports, a food hopper, a house
//! light and a speaker through sessions of trials. Which stimulus comes next
//! is decided by the queue of the current [`blocks::Block`]; whether a scored
//! response earns food or a timeout is decided by its reinforcement schedule.
//! Every finished trial is appended to a [`store::DataStore`] and every
//! hardware state change is announced on the [`events::EventBus`].
//!
//! Hardware is reached only through [`hwio::HardwareInterface`]. The
//! [`sim::SimInterface`] implementation runs the whole stack in-process
//! against a [`clock::ManualClock`] or the system clock.

pub mod behavior;
pub mod blocks;
pub mod clock;
pub mod components;
pub mod conditions;
pub mod config;
pub mod error;
pub mod events;
pub mod experiment;
pub mod hwio;
pub mod machine;
pub mod panel;
pub mod queues;
pub mod reinforcement;
pub mod schedulers;
pub mod shaping;
pub mod sim;
pub mod snapshot;
mod states;
pub mod storage;
pub mod store;
pub mod summary;
pub mod trial;

pub use behavior::{Behavior, ChoiceBehavior, WaitForStimulusBehavior};
pub use config::ExperimentConfig;
pub use error::{Error, Result};
pub use experiment::{Experiment, ExperimentOptions};
pub use shaping::{ShapingBehavior, ShapingOptions, ShapingStage};
pub use states::LifeState;
