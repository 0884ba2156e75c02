//! Execution seams and the paper broker used for dry runs.

mod gateway;
mod paper;
mod types;

pub use gateway::{Broker, ExecutionGateway, PositionLedger};
pub use paper::PaperBroker;
pub use types::*;
