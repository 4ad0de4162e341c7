//! Validated, nL-normalised view of an `InputData` document.

use crate::config::EchoParameters;
use crate::error::{EchoError, Result};
use crate::inventory::{CompoundInventory, CompoundLocation};
use crate::pattern::Pattern;
use crate::well_block::{format_well_block, get_some_wells, split_blocks};
use echo_protocol::{InputData, PatternType, NL_PER_UL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutBlock {
    pub pattern: String,
    pub block: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInput {
    pub params: EchoParameters,
    pub patterns: BTreeMap<String, Pattern>,
    pub pattern_order: Vec<String>,
    pub layout: Vec<LayoutBlock>,
    pub inventory: CompoundInventory,
    pub intermediate_barcodes: Vec<String>,
    pub destination_barcodes: Vec<String>,
}

impl PlanInput {
    pub fn from_input_data(data: &InputData) -> Result<Self> {
        let params = EchoParameters::from_common_data(&data.common)?;

        let mut patterns = BTreeMap::new();
        let mut pattern_order = vec![];
        for row in &data.patterns {
            let pattern = Pattern::from_row(row)?;
            if patterns.contains_key(&pattern.name) {
                return Err(EchoError::InvalidInput(format!(
                    "Pattern '{}' is defined twice",
                    pattern.name
                )));
            }
            pattern_order.push(pattern.name.clone());
            patterns.insert(pattern.name.clone(), pattern);
        }

        let mut layout = vec![];
        for row in &data.layout {
            let name = row.pattern.trim();
            if !patterns.contains_key(name) {
                return Err(EchoError::UnknownPattern(name.to_string()));
            }
            for token in split_blocks(&row.well_block) {
                let wells = get_some_wells(&token)?;
                layout.push(LayoutBlock {
                    pattern: name.to_string(),
                    block: format_well_block(&wells)?,
                });
            }
        }

        let mut inventory = CompoundInventory::new();
        for row in &data.compounds {
            let compound_id = row.compound_id.trim();
            if compound_id.is_empty() {
                return Err(EchoError::InvalidInput(format!(
                    "Compound row on plate '{}' well '{}' has no compound ID",
                    row.barcode, row.well
                )));
            }
            let names = row.pattern_names();
            if names.is_empty() {
                return Err(EchoError::InvalidInput(format!(
                    "Compound '{compound_id}' is not assigned to any pattern"
                )));
            }
            let mut solvent_only = true;
            for name in &names {
                let pattern = patterns
                    .get(name)
                    .ok_or_else(|| EchoError::UnknownPattern(name.clone()))?;
                solvent_only &= pattern.pattern_type == PatternType::Solvent;
            }
            if !solvent_only && (!row.concentration.is_finite() || row.concentration <= 0.0) {
                return Err(EchoError::InvalidInput(format!(
                    "Compound '{compound_id}' needs a positive concentration"
                )));
            }
            if !row.volume.is_finite() || row.volume < 0.0 {
                return Err(EchoError::InvalidInput(format!(
                    "Compound '{compound_id}' has an invalid volume {}",
                    row.volume
                )));
            }
            for well_id in get_some_wells(&row.well)? {
                for name in &names {
                    inventory.add_location(
                        compound_id,
                        name,
                        CompoundLocation {
                            barcode: row.barcode.trim().to_string(),
                            well_id: well_id.clone(),
                            volume: row.volume * NL_PER_UL,
                            concentration: row.concentration,
                        },
                    );
                }
            }
        }

        Ok(Self {
            params,
            patterns,
            pattern_order,
            layout,
            inventory,
            intermediate_barcodes: data.intermediate_barcodes(),
            destination_barcodes: data.destination_barcodes(),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let data = InputData::from_json_str(text)?;
        Self::from_input_data(&data)
    }

    pub fn load_from_path(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn pattern(&self, name: &str) -> Option<&Pattern> {
        self.patterns.get(name)
    }

    /// Patterns in declaration order.
    pub fn ordered_patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.pattern_order
            .iter()
            .filter_map(|name| self.patterns.get(name))
    }

    pub fn layout_blocks(&self, pattern_name: &str) -> Vec<&str> {
        self.layout
            .iter()
            .filter(|b| b.pattern == pattern_name)
            .map(|b| b.block.as_str())
            .collect()
    }

    /// A compound whose only pattern is Solvent-type is a solvent reservoir.
    pub fn is_solvent_compound(&self, compound_id: &str) -> bool {
        self.inventory
            .patterns_for(compound_id)
            .map(|patterns| {
                patterns.len() == 1
                    && patterns.keys().all(|name| {
                        self.patterns
                            .get(name)
                            .map(|p| p.pattern_type == PatternType::Solvent)
                            .unwrap_or(false)
                    })
            })
            .unwrap_or(false)
    }
}
