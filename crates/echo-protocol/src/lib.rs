//! Contracts shared between the Echo planning core and its collaborators
//! (spreadsheet import, plate rendering, CSV export).

pub mod checkpoint;
pub mod input;
pub mod transfer;

pub use checkpoint::{Checkpoint, CheckpointStatus, CheckpointTracker};
pub use input::{
    BarcodeRow, CommonData, CompoundRow, Direction, InputData, LayoutRow, PatternRow, PatternType,
};
pub use transfer::{TransferStage, TransferStep};

pub const PROTOCOL_VERSION: &str = "v1";

/// Volumes cross the boundary in µL and are handled in nL internally.
pub const NL_PER_UL: f64 = 1000.0;

pub const MAX_PATTERN_CONCENTRATIONS: usize = 20;
