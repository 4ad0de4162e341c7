use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternType {
    Treatment,
    Control,
    Combination,
    Solvent,
    Unused,
}

impl PatternType {
    /// Whether wells stamped with this pattern receive compound transfers.
    pub fn carries_concentrations(self) -> bool {
        matches!(self, Self::Treatment | Self::Control | Self::Combination)
    }
}

/// Scan direction used to spread a concentration series over a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    LR,
    RL,
    TB,
    BT,
}

impl Direction {
    /// LR/RL walk along rows, TB/BT walk down columns.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Self::LR | Self::RL)
    }

    pub fn is_reversed(self) -> bool {
        matches!(self, Self::RL | Self::BT)
    }
}

/// Scalar assay settings. Volumes are in µL, concentrations in µM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonData {
    pub max_dmso_fraction: f64,
    pub intermediate_backfill_volume: f64,
    pub final_assay_volume: f64,
    pub allowable_error: f64,
    pub dest_replicates: usize,
    pub create_int_concs: bool,
    pub dmso_normalization: bool,
    pub droplet_size_nl: f64,
    pub max_transfer_volume_nl: f64,
    pub destination_plate_size: usize,
    pub intermediate_plate_size: usize,
}

impl Default for CommonData {
    fn default() -> Self {
        Self {
            max_dmso_fraction: 0.005,
            intermediate_backfill_volume: 40.0,
            final_assay_volume: 25.0,
            allowable_error: 0.1,
            dest_replicates: 1,
            create_int_concs: true,
            dmso_normalization: false,
            droplet_size_nl: 2.5,
            max_transfer_volume_nl: 500.0,
            destination_plate_size: 384,
            intermediate_plate_size: 384,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRow {
    pub name: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    #[serde(default)]
    pub directions: Vec<Direction>,
    #[serde(default = "default_replicates")]
    pub replicates: usize,
    #[serde(default)]
    pub concentrations: Vec<Option<f64>>,
    #[serde(default)]
    pub fold: Option<usize>,
}

fn default_replicates() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRow {
    pub pattern: String,
    pub well_block: String,
}

/// One stock aliquot (or a block of identical aliquots). `patterns` is a
/// semicolon-separated list of pattern names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundRow {
    pub barcode: String,
    pub well: String,
    pub compound_id: String,
    #[serde(default)]
    pub concentration: f64,
    pub volume: f64,
    pub patterns: String,
}

impl CompoundRow {
    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns
            .split(';')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarcodeRow {
    #[serde(default)]
    pub intermediate: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputData {
    #[serde(default)]
    pub common: CommonData,
    pub patterns: Vec<PatternRow>,
    pub layout: Vec<LayoutRow>,
    pub compounds: Vec<CompoundRow>,
    #[serde(default)]
    pub barcodes: Vec<BarcodeRow>,
}

impl InputData {
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn intermediate_barcodes(&self) -> Vec<String> {
        Self::barcode_pool(self.barcodes.iter().map(|b| b.intermediate.as_deref()))
    }

    pub fn destination_barcodes(&self) -> Vec<String> {
        Self::barcode_pool(self.barcodes.iter().map(|b| b.destination.as_deref()))
    }

    fn barcode_pool<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
        values
            .flatten()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}
