use serde::{Deserialize, Serialize};

/// One acoustic transfer. Volume is in nL. Emitted once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStep {
    pub source_barcode: String,
    pub source_well_id: String,
    pub destination_barcode: String,
    pub destination_well_id: String,
    pub volume: f64,
}

/// Export stages, declared in the order they have to be run on the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransferStage {
    SourceToInt1,
    Int1ToInt2,
    SourceToDest,
    Int1ToDest,
    Int2ToDest,
    SolventBackfill,
}

impl TransferStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::SourceToInt1 => "source_to_int1",
            Self::Int1ToInt2 => "int1_to_int2",
            Self::SourceToDest => "source_to_dest",
            Self::Int1ToDest => "int1_to_dest",
            Self::Int2ToDest => "int2_to_dest",
            Self::SolventBackfill => "solvent_backfill",
        }
    }
}
