//! Trading logic: signal detection, staged entries, risk sizing, exits.

mod config;
mod exit_manager;
mod history;
mod risk_sizer;
mod sequencer;
mod signal;

pub use config::{EngineConfig, InstrumentSpec};
pub use exit_manager::{ExitCycle, ExitManager, ExitReport};
pub use history::BarHistory;
pub use risk_sizer::RiskSizer;
pub use sequencer::{
    EntryContext, EntrySequenceState, EntrySequencer, SignalDisposition, TimeoutOutcome,
    TrancheTrigger,
};
pub use signal::SignalDetector;
