use crate::error::{EchoError, Result};
use crate::pattern::Pattern;
use crate::well::{Content, Solvent, Well};
use crate::well_block::{coords_from_well_id, get_some_wells, map_wells_to_concentrations, well_id_from_coords};
use echo_protocol::PatternType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const META_MAX_CONCENTRATION: &str = "max_concentration";
pub const META_MAX_ASSAY_CONCENTRATION: &str = "max_assay_concentration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlateSize {
    Wells12,
    Wells24,
    Wells48,
    Wells96,
    Wells384,
    Wells1536,
}

impl PlateSize {
    pub fn all() -> [PlateSize; 6] {
        [
            Self::Wells12,
            Self::Wells24,
            Self::Wells48,
            Self::Wells96,
            Self::Wells384,
            Self::Wells1536,
        ]
    }

    pub fn rows(self) -> usize {
        match self {
            Self::Wells12 => 3,
            Self::Wells24 => 4,
            Self::Wells48 => 6,
            Self::Wells96 => 8,
            Self::Wells384 => 16,
            Self::Wells1536 => 32,
        }
    }

    pub fn columns(self) -> usize {
        match self {
            Self::Wells12 => 4,
            Self::Wells24 => 6,
            Self::Wells48 => 8,
            Self::Wells96 => 12,
            Self::Wells384 => 24,
            Self::Wells1536 => 48,
        }
    }

    pub fn well_count(self) -> usize {
        self.rows() * self.columns()
    }

    pub fn from_well_count(count: usize) -> Option<Self> {
        Self::all().into_iter().find(|s| s.well_count() == count)
    }

    /// Smallest format that contains every given (row, column).
    pub fn smallest_fitting(coords: impl Iterator<Item = (usize, usize)>) -> Option<Self> {
        let (max_row, max_col) = coords.fold((0, 0), |(r, c), (r2, c2)| (r.max(r2), c.max(c2)));
        Self::all()
            .into_iter()
            .find(|s| max_row < s.rows() && max_col < s.columns())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlateRole {
    Source,
    Intermediate1,
    Intermediate2,
    Destination,
}

impl PlateRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Intermediate1 => "intermediate1",
            Self::Intermediate2 => "intermediate2",
            Self::Destination => "destination",
        }
    }
}

/// A physical plate. The well set is created once from the plate size and
/// never resized; wells are stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plate {
    id: usize,
    barcode: String,
    role: PlateRole,
    size: PlateSize,
    wells: Vec<Well>,
    patterns: BTreeMap<String, Pattern>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Plate {
    pub fn new(id: usize, barcode: &str, role: PlateRole, size: PlateSize) -> Self {
        let mut wells = Vec::with_capacity(size.well_count());
        for row in 0..size.rows() {
            for col in 0..size.columns() {
                wells.push(Well::new(&well_id_from_coords(row, col), row, col));
            }
        }
        Self {
            id,
            barcode: barcode.to_string(),
            role,
            size,
            wells,
            patterns: BTreeMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline(always)]
    pub fn barcode(&self) -> &str {
        &self.barcode
    }

    #[inline(always)]
    pub fn role(&self) -> PlateRole {
        self.role
    }

    #[inline(always)]
    pub fn size(&self) -> PlateSize {
        self.size
    }

    #[inline(always)]
    pub fn rows(&self) -> usize {
        self.size.rows()
    }

    #[inline(always)]
    pub fn columns(&self) -> usize {
        self.size.columns()
    }

    pub fn wells(&self) -> &[Well] {
        &self.wells
    }

    pub fn patterns(&self) -> &BTreeMap<String, Pattern> {
        &self.patterns
    }

    fn index_of(&self, well_id: &str) -> Option<usize> {
        let (row, col) = coords_from_well_id(well_id).ok()?;
        (row < self.rows() && col < self.columns()).then(|| row * self.columns() + col)
    }

    fn unknown_well(&self, well_id: &str) -> EchoError {
        EchoError::UnknownWell {
            barcode: self.barcode.clone(),
            well_id: well_id.to_string(),
        }
    }

    pub fn get_well(&self, well_id: &str) -> Option<&Well> {
        self.index_of(well_id).map(|idx| &self.wells[idx])
    }

    pub fn require_well_mut(&mut self, well_id: &str) -> Result<&mut Well> {
        match self.index_of(well_id) {
            Some(idx) => Ok(&mut self.wells[idx]),
            None => Err(self.unknown_well(well_id)),
        }
    }

    pub fn get_some_wells(&self, block: &str) -> Result<Vec<&Well>> {
        get_some_wells(block)?
            .iter()
            .map(|id| self.get_well(id).ok_or_else(|| self.unknown_well(id)))
            .collect()
    }

    fn block_indices(&self, block: &str) -> Result<Vec<usize>> {
        get_some_wells(block)?
            .iter()
            .map(|id| self.index_of(id).ok_or_else(|| self.unknown_well(id)))
            .collect()
    }

    /// Fills the given block (every well when `None`) with solvent.
    pub fn bulk_fill_wells(&mut self, block: Option<&str>, solvent: &str, volume: f64) -> Result<()> {
        let indices = match block {
            Some(block) => self.block_indices(block)?,
            None => (0..self.wells.len()).collect(),
        };
        for idx in indices {
            self.wells[idx].add_solvent(Solvent::new(solvent, volume));
        }
        Ok(())
    }

    pub fn apply_pattern(&mut self, block: &str, pattern: &Pattern) -> Result<()> {
        let indices = self.block_indices(block)?;
        match pattern.pattern_type {
            PatternType::Unused => {
                for idx in indices {
                    self.wells[idx].mark_unused();
                }
            }
            PatternType::Solvent => {}
            _ => {
                let slots = map_wells_to_concentrations(
                    block,
                    pattern.slot_count(),
                    pattern.direction_for_axis(0),
                )?;
                for (slot, well_ids) in slots.iter().enumerate() {
                    let Some(concentration) = pattern.concentrations[slot] else {
                        continue;
                    };
                    for well_id in well_ids {
                        let content = Content::new(None, concentration, Some(&pattern.name));
                        self.require_well_mut(well_id)?.stamp_content(content);
                    }
                }
            }
        }
        self.patterns
            .entry(pattern.name.clone())
            .or_insert_with(|| {
                let mut copy = pattern.clone();
                copy.locations.clear();
                copy
            })
            .add_location(block);
        Ok(())
    }

    pub fn remove_pattern(&mut self, block: &str, pattern_name: &str) -> Result<()> {
        let pattern = self
            .patterns
            .get_mut(pattern_name)
            .ok_or_else(|| EchoError::UnknownPattern(pattern_name.to_string()))?;
        let pattern_type = pattern.pattern_type;
        pattern.remove_location(block);
        if pattern.locations.is_empty() {
            self.patterns.remove(pattern_name);
        }
        for idx in self.block_indices(block)? {
            let well = &mut self.wells[idx];
            well.remove_pattern_contents(pattern_name);
            if pattern_type == PatternType::Unused {
                well.mark_used();
            }
        }
        Ok(())
    }

    /// Wells that are usable and hold liquid.
    pub fn used_wells(&self) -> impl Iterator<Item = &Well> {
        self.wells
            .iter()
            .filter(|w| !w.is_unused() && w.total_volume() > 0.0)
    }

    pub fn max_compound_concentration(&self) -> Option<f64> {
        self.wells
            .iter()
            .filter_map(|w| w.max_compound_concentration())
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))))
    }

    pub fn update_metadata(&mut self) {
        match self.max_compound_concentration() {
            Some(max) => {
                self.metadata
                    .insert(META_MAX_CONCENTRATION.to_string(), serde_json::json!(max));
            }
            None => {
                self.metadata.remove(META_MAX_CONCENTRATION);
            }
        }
    }

    /// Highest compound concentration any well reaches at the assay volume.
    pub fn update_assay_metadata(&mut self, assay_volume: f64) {
        let max = self
            .wells
            .iter()
            .flat_map(|w| {
                w.contents()
                    .iter()
                    .filter_map(|c| c.compound_id.as_deref())
                    .filter_map(move |id| w.assay_concentration(id, assay_volume))
            })
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))));
        match max {
            Some(max) => {
                self.metadata
                    .insert(META_MAX_ASSAY_CONCENTRATION.to_string(), serde_json::json!(max));
            }
            None => {
                self.metadata.remove(META_MAX_ASSAY_CONCENTRATION);
            }
        }
    }
}
