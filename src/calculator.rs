//! Allocation of physical wells and generation of the transfer list.
//!
//! Plates live in one arena and are addressed by index. A run goes through
//! the phases once: source plates, intermediate plates, intermediate fill,
//! destination plates, optional DMSO normalisation, plate metadata.

use crate::config::{DMSO, EchoParameters};
use crate::error::{EchoError, Result};
use crate::input::PlanInput;
use crate::pattern::Pattern;
use crate::plate::{Plate, PlateRole, PlateSize};
use crate::pre_calculator::{NeedKey, PreCalcResult};
use crate::solver::{ConcKey, ConcentrationObj, SourceType};
use crate::well::{Content, Solvent};
use crate::well_block::map_wells_to_concentrations;
use echo_protocol::{CheckpointStatus, CheckpointTracker, PatternType, TransferStage, TransferStep};
use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use tracing::{debug, info, warn};

pub const CHECKPOINT_ALLOCATION: &str = "Allocation";

pub type PlateIdx = usize;
pub type WellRef = (PlateIdx, String);

const VOLUME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Serialize)]
pub struct EchoResult {
    pub plates: Vec<Plate>,
    pub transfers: Vec<TransferStep>,
    /// Stage of each entry in `transfers`.
    pub stages: Vec<TransferStage>,
    pub checkpoints: CheckpointTracker,
}

impl EchoResult {
    pub fn plate(&self, barcode: &str) -> Option<&Plate> {
        self.plates.iter().find(|p| p.barcode() == barcode)
    }

    pub fn plates_with_role(&self, role: PlateRole) -> impl Iterator<Item = &Plate> {
        self.plates.iter().filter(move |p| p.role() == role)
    }

    /// Transfers grouped in the order they have to run on the instrument.
    pub fn staged_transfers(&self) -> BTreeMap<TransferStage, Vec<TransferStep>> {
        let mut ret: BTreeMap<TransferStage, Vec<TransferStep>> = BTreeMap::new();
        for (stage, step) in self.stages.iter().zip(&self.transfers) {
            ret.entry(*stage).or_default().push(step.clone());
        }
        ret
    }
}

fn stage_for(source_type: SourceType) -> TransferStage {
    match source_type {
        SourceType::Src => TransferStage::SourceToDest,
        SourceType::Int1 => TransferStage::Int1ToDest,
        SourceType::Int2 => TransferStage::Int2ToDest,
    }
}

pub struct EchoCalculator<'a> {
    input: &'a PlanInput,
    pre: &'a PreCalcResult,
    plates: Vec<Plate>,
    transfers: Vec<TransferStep>,
    stages: Vec<TransferStage>,
    tracker: CheckpointTracker,
    free_int1: VecDeque<WellRef>,
    free_int2: VecDeque<WellRef>,
    intermediate_well_cache: HashMap<(String, NeedKey), Vec<WellRef>>,
    pattern_location_cache: HashMap<(String, PlateIdx), VecDeque<WellRef>>,
    solvent_cursor: usize,
}

impl<'a> EchoCalculator<'a> {
    pub fn new(input: &'a PlanInput, pre: &'a PreCalcResult) -> Result<Self> {
        if let Some(failed) = pre
            .checkpoints
            .iter()
            .find(|c| c.status == CheckpointStatus::Failed)
        {
            return Err(EchoError::CheckpointFailed(failed.name.clone()));
        }
        let mut tracker = pre.checkpoints.clone();
        tracker.add(CHECKPOINT_ALLOCATION);
        Ok(Self {
            input,
            pre,
            plates: vec![],
            transfers: vec![],
            stages: vec![],
            tracker,
            free_int1: VecDeque::new(),
            free_int2: VecDeque::new(),
            intermediate_well_cache: HashMap::new(),
            pattern_location_cache: HashMap::new(),
            solvent_cursor: 0,
        })
    }

    fn params(&self) -> &EchoParameters {
        &self.input.params
    }

    pub fn run(mut self) -> Result<EchoResult> {
        self.create_source_plates()?;
        self.create_intermediate_plates()?;
        self.fill_intermediates()?;
        self.fill_destinations()?;
        if self.params().dmso_normalization {
            self.normalize_dmso()?;
        }
        let assay_volume = self.params().assay_volume;
        for plate in &mut self.plates {
            plate.update_metadata();
            if plate.role() == PlateRole::Destination {
                plate.update_assay_metadata(assay_volume);
            }
        }
        self.tracker.pass(CHECKPOINT_ALLOCATION);
        info!(
            "allocation done: {} plate(s), {} transfer(s)",
            self.plates.len(),
            self.transfers.len()
        );
        Ok(EchoResult {
            plates: self.plates,
            transfers: self.transfers,
            stages: self.stages,
            checkpoints: self.tracker,
        })
    }

    fn add_plate(&mut self, barcode: &str, role: PlateRole, size: PlateSize) -> PlateIdx {
        let idx = self.plates.len();
        self.plates.push(Plate::new(idx, barcode, role, size));
        idx
    }

    fn plate_indices(&self, role: PlateRole) -> Vec<PlateIdx> {
        self.plates
            .iter()
            .enumerate()
            .filter(|(_, p)| p.role() == role)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn dead_volume_of(&self, plate: PlateIdx) -> f64 {
        let plate = &self.plates[plate];
        match plate.role() {
            PlateRole::Source => self.pre.dead_volume(plate.barcode()),
            PlateRole::Intermediate1 | PlateRole::Intermediate2 => self.params().intermediate_dead_volume(),
            PlateRole::Destination => 0.0,
        }
    }

    fn has_volume(&self, (plate, well_id): (PlateIdx, &str), volume: f64) -> bool {
        self.plates[plate]
            .get_well(well_id)
            .map(|w| !w.is_unused() && w.total_volume() + VOLUME_EPSILON >= volume + self.dead_volume_of(plate))
            .unwrap_or(false)
    }

    fn allocation_warning(&mut self, message: String) {
        warn!("{message}");
        self.tracker.warn(CHECKPOINT_ALLOCATION, message);
    }

    fn create_source_plates(&mut self) -> Result<()> {
        let input = self.input;
        let locations = input.inventory.unique_locations();
        for barcode in input.inventory.barcodes() {
            let on_plate = locations
                .iter()
                .filter(|(_, loc)| loc.barcode == barcode)
                .collect::<Vec<_>>();
            let coords = on_plate
                .iter()
                .map(|(_, loc)| crate::well_block::coords_from_well_id(&loc.well_id))
                .collect::<Result<Vec<_>>>()?;
            let size = PlateSize::smallest_fitting(coords.into_iter()).ok_or_else(|| {
                EchoError::InvalidInput(format!("Source plate {barcode} does not fit any plate format"))
            })?;
            let idx = self.add_plate(&barcode, PlateRole::Source, size);
            for (compound, loc) in on_plate {
                let solvent_only = input.is_solvent_compound(compound);
                let well = self.plates[idx].require_well_mut(&loc.well_id)?;
                if solvent_only {
                    well.add_solvent(Solvent::new(DMSO, loc.volume));
                } else {
                    well.add_content(
                        Content::new(Some(compound.as_str()), loc.concentration, None),
                        loc.volume,
                        DMSO,
                    );
                }
            }
            debug!("source plate {barcode} ({} wells)", size.well_count());
        }
        info!("{} source plate(s)", self.plates.len());
        Ok(())
    }

    /// Solvent wells needed on intermediate plates when the source
    /// reservoirs cannot cover the normalisation backfill.
    fn extra_dmso_wells(&self) -> usize {
        if !self.params().dmso_normalization || self.pre.total_dmso_backfill_vol <= 0.0 {
            return 0;
        }
        let mut available = 0.0;
        for idx in self.plate_indices(PlateRole::Source) {
            let dead = self.dead_volume_of(idx);
            available += self.plates[idx]
                .wells()
                .iter()
                .filter(|w| w.is_solvent_only(DMSO))
                .map(|w| (w.total_volume() - dead).max(0.0))
                .sum::<f64>();
        }
        let shortfall = self.pre.total_dmso_backfill_vol - available;
        let usable = self.params().backfill_volume - self.params().intermediate_dead_volume();
        if shortfall <= 0.0 || usable <= 0.0 {
            return 0;
        }
        (shortfall / usable).ceil() as usize
    }

    fn create_intermediate_plates(&mut self) -> Result<()> {
        let size = self.params().intermediate_plate_size;
        let per_plate = size.well_count();
        let dmso_wells = self.extra_dmso_wells();
        let level1 = (self.pre.int1_wells + dmso_wells).div_ceil(per_plate);
        let level2 = self.pre.int2_wells.div_ceil(per_plate);
        let backfill = self.params().backfill_volume;

        let input = self.input;
        let mut declared = input.intermediate_barcodes.iter();
        let mut count = 0;
        for (role, plates) in [(PlateRole::Intermediate1, level1), (PlateRole::Intermediate2, level2)] {
            for _ in 0..plates {
                count += 1;
                let barcode = declared
                    .next()
                    .cloned()
                    .unwrap_or_else(|| format!("IntPlate_{count}"));
                let idx = self.add_plate(&barcode, role, size);
                self.plates[idx].bulk_fill_wells(None, DMSO, backfill)?;
                let wells = self.plates[idx]
                    .wells()
                    .iter()
                    .map(|w| (idx, w.id().to_string()))
                    .collect::<Vec<_>>();
                match role {
                    PlateRole::Intermediate2 => self.free_int2.extend(wells),
                    _ => self.free_int1.extend(wells),
                }
            }
        }
        // Backfill reservoirs come off the end so intermediates stay packed.
        for _ in 0..dmso_wells {
            self.free_int1.pop_back();
        }
        info!(
            "{level1} level-1 and {level2} level-2 intermediate plate(s), {dmso_wells} extra DMSO well(s)"
        );
        Ok(())
    }

    /// First well holding `compound` at `conc` with `volume` nL above the
    /// dead volume of its plate.
    pub fn find_available_source_well(
        &self,
        compound: &str,
        source_type: SourceType,
        conc: f64,
        volume: f64,
    ) -> Option<WellRef> {
        let key = ConcKey::new(conc);
        if source_type.is_intermediate() {
            return self
                .intermediate_well_cache
                .get(&(compound.to_string(), (source_type, key)))?
                .iter()
                .find(|(plate, well_id)| self.has_volume((*plate, well_id.as_str()), volume))
                .cloned();
        }
        for idx in self.plate_indices(PlateRole::Source) {
            for well in self.plates[idx].wells() {
                let matches = well
                    .content_for(compound)
                    .map(|c| ConcKey::new(c.concentration) == key)
                    .unwrap_or(false);
                if matches && self.has_volume((idx, well.id()), volume) {
                    return Some((idx, well.id().to_string()));
                }
            }
        }
        None
    }

    /// Moves `volume` nL and logs the step. Compound contents arrive under
    /// `pattern_name` in the destination well.
    fn transfer(
        &mut self,
        source: &WellRef,
        destination: (PlateIdx, &str),
        volume: f64,
        stage: TransferStage,
        pattern_name: Option<&str>,
    ) -> Result<()> {
        let (src_plate, src_well) = source;
        let (dst_plate, dst_well) = destination;
        let well = self.plates[*src_plate].require_well_mut(src_well)?;
        let contents = well
            .contents()
            .iter()
            .filter(|c| c.compound_id.is_some())
            .map(|c| Content {
                pattern_name: pattern_name.map(|s| s.to_string()),
                ..c.clone()
            })
            .collect::<Vec<_>>();
        well.remove_volume(volume)?;
        self.plates[dst_plate]
            .require_well_mut(dst_well)?
            .mix_in(&contents, volume, DMSO);
        self.transfers.push(TransferStep {
            source_barcode: self.plates[*src_plate].barcode().to_string(),
            source_well_id: src_well.clone(),
            destination_barcode: self.plates[dst_plate].barcode().to_string(),
            destination_well_id: dst_well.to_string(),
            volume,
        });
        self.stages.push(stage);
        Ok(())
    }

    fn fill_intermediates(&mut self) -> Result<()> {
        let mut demand = self.pre.intermediate_demand.clone();
        demand.sort_by_key(|d| d.recipe.level);
        for entry in demand {
            let recipe = entry.recipe;
            let stage = match recipe.level {
                SourceType::Int2 => TransferStage::Int1ToInt2,
                _ => TransferStage::SourceToInt1,
            };
            let mut filled = vec![];
            for _ in 0..entry.wells {
                let free = match recipe.level {
                    SourceType::Int2 => self.free_int2.pop_front(),
                    _ => self.free_int1.pop_front(),
                };
                let Some((plate, well_id)) = free else {
                    self.allocation_warning(format!(
                        "No free {} well left for {} at {:.6} µM",
                        recipe.level.as_str(),
                        entry.compound_id,
                        recipe.concentration
                    ));
                    break;
                };
                let Some(source) = self.find_available_source_well(
                    &entry.compound_id,
                    recipe.source_type,
                    recipe.source_conc,
                    recipe.vol_to_transfer,
                ) else {
                    self.allocation_warning(format!(
                        "No {} well of {} at {} µM holds {} nL above its dead volume for intermediate {}",
                        recipe.source_type.as_str(),
                        entry.compound_id,
                        recipe.source_conc,
                        recipe.vol_to_transfer,
                        well_id
                    ));
                    break;
                };
                self.transfer(&source, (plate, well_id.as_str()), recipe.vol_to_transfer, stage, None)?;
                filled.push((plate, well_id));
            }
            debug!(
                "{} {} well(s) of {} at {:.6} µM",
                filled.len(),
                recipe.level.as_str(),
                entry.compound_id,
                recipe.concentration
            );
            self.intermediate_well_cache
                .entry((entry.compound_id.clone(), recipe.key()))
                .or_default()
                .extend(filled);
        }
        Ok(())
    }

    fn compounds_for(&self, pattern: &Pattern) -> Vec<String> {
        self.input
            .inventory
            .compounds_with_pattern(&pattern.name)
            .into_iter()
            .filter(|c| !self.input.is_solvent_compound(c))
            .collect()
    }

    fn recipe_for(&self, compound: &str, pattern: &str, target: f64) -> Option<ConcentrationObj> {
        self.pre.plan(compound, pattern)?.get(target).copied()
    }

    /// Next block of `pattern` not yet stamped on any plate in `plates`.
    pub fn find_next_available_block(&mut self, pattern: &Pattern, plates: Range<PlateIdx>) -> Option<WellRef> {
        let key = (pattern.name.clone(), plates.start);
        if let Some(next) = self.pattern_location_cache.get_mut(&key).and_then(|c| c.pop_front()) {
            return Some(next);
        }
        let input = self.input;
        let blocks = input.layout_blocks(&pattern.name);
        let mut fresh = VecDeque::new();
        for idx in plates {
            let stamped = self.plates[idx].patterns().get(&pattern.name);
            for block in &blocks {
                let taken = stamped
                    .map(|p| p.locations.iter().any(|l| l == block))
                    .unwrap_or(false);
                if !taken {
                    fresh.push_back((idx, block.to_string()));
                }
            }
        }
        let next = fresh.pop_front();
        self.pattern_location_cache.insert(key, fresh);
        next
    }

    fn compound_transfer(
        &mut self,
        compound: &str,
        obj: &ConcentrationObj,
        destination: (PlateIdx, &str),
        pattern_name: &str,
    ) -> Result<()> {
        let Some(source) =
            self.find_available_source_well(compound, obj.source_type, obj.source_conc, obj.vol_to_transfer)
        else {
            let barcode = self.plates[destination.0].barcode().to_string();
            self.allocation_warning(format!(
                "Skipped {} nL of {compound} into {barcode}:{}: no {} well at {} µM has enough volume",
                obj.vol_to_transfer,
                destination.1,
                obj.source_type.as_str(),
                obj.source_conc
            ));
            return Ok(());
        };
        self.transfer(
            &source,
            destination,
            obj.vol_to_transfer,
            stage_for(obj.source_type),
            Some(pattern_name),
        )
    }

    /// Fills one stamped block; compound `k` follows the pattern's `k`-th direction.
    fn fill_block(&mut self, plate: PlateIdx, block: &str, pattern: &Pattern, compounds: &[String]) -> Result<()> {
        for (axis, compound) in compounds.iter().enumerate() {
            let slots = map_wells_to_concentrations(block, pattern.slot_count(), pattern.direction_for_axis(axis))?;
            for (slot, well_ids) in slots.iter().enumerate() {
                let Some(target) = pattern.concentrations[slot] else {
                    continue;
                };
                let Some(obj) = self.recipe_for(compound, &pattern.name, target) else {
                    continue;
                };
                for well_id in well_ids {
                    self.compound_transfer(compound, &obj, (plate, well_id.as_str()), &pattern.name)?;
                }
            }
        }
        Ok(())
    }

    fn place(&mut self, pattern: &Pattern, plates: Range<PlateIdx>, compounds: &[String]) -> Result<()> {
        let Some((plate, block)) = self.find_next_available_block(pattern, plates) else {
            self.allocation_warning(format!(
                "No free '{}' block left for {}",
                pattern.name,
                compounds.join(" + ")
            ));
            return Ok(());
        };
        self.plates[plate].apply_pattern(&block, pattern)?;
        self.fill_block(plate, &block, pattern, compounds)
    }

    fn fill_destinations(&mut self) -> Result<()> {
        let per_group = self.pre.destination_plates_per_group.max(1);
        let groups = self.params().dest_replicates.max(1);
        let size = self.params().destination_plate_size;
        let input = self.input;
        let mut declared = input.destination_barcodes.iter();
        let first = self.plates.len();
        for n in 1..=per_group * groups {
            let barcode = declared
                .next()
                .cloned()
                .unwrap_or_else(|| format!("DestPlate_{n}"));
            self.add_plate(&barcode, PlateRole::Destination, size);
        }
        let destinations = first..self.plates.len();

        let patterns = input.ordered_patterns().cloned().collect::<Vec<_>>();
        for pattern in patterns.iter().filter(|p| p.pattern_type == PatternType::Unused) {
            for idx in destinations.clone() {
                for block in input.layout_blocks(&pattern.name) {
                    self.plates[idx].apply_pattern(block, pattern)?;
                }
            }
        }

        for group in 0..groups {
            let start = first + group * per_group;
            let plates = start..start + per_group;
            for pattern in &patterns {
                match pattern.pattern_type {
                    PatternType::Treatment => {
                        for compound in self.compounds_for(pattern) {
                            self.place(pattern, plates.clone(), std::slice::from_ref(&compound))?;
                        }
                    }
                    PatternType::Combination => {
                        let combos = self
                            .compounds_for(pattern)
                            .into_iter()
                            .combinations(pattern.fold_count())
                            .collect::<Vec<_>>();
                        for combo in combos {
                            self.place(pattern, plates.clone(), &combo)?;
                        }
                    }
                    _ => {}
                }
            }
            debug!("replicate group {} filled", group + 1);
        }

        // Controls rotate through every slot on every destination plate.
        for pattern in patterns.iter().filter(|p| p.pattern_type == PatternType::Control) {
            let compounds = self.compounds_for(pattern);
            if compounds.is_empty() {
                continue;
            }
            let mut slot = 0;
            for idx in destinations.clone() {
                for block in input.layout_blocks(&pattern.name) {
                    let compound = &compounds[slot % compounds.len()];
                    self.plates[idx].apply_pattern(block, pattern)?;
                    self.fill_block(idx, block, pattern, std::slice::from_ref(compound))?;
                    slot += 1;
                }
            }
        }
        info!("{} destination plate(s)", destinations.len());
        Ok(())
    }

    /// First reservoir from the cursor on that can give `volume`. The cursor
    /// only moves past wells that cannot give a single droplet.
    fn next_solvent_well(&mut self, wells: &[WellRef], volume: f64) -> Option<WellRef> {
        let droplet = self.params().droplet_size;
        while let Some((plate, well_id)) = wells.get(self.solvent_cursor) {
            if self.has_volume((*plate, well_id.as_str()), droplet) {
                break;
            }
            self.solvent_cursor += 1;
        }
        wells
            .iter()
            .skip(self.solvent_cursor)
            .find(|(plate, well_id)| self.has_volume((*plate, well_id.as_str()), volume))
            .cloned()
    }

    /// Tops every used destination well up to its plate's largest volume.
    fn normalize_dmso(&mut self) -> Result<()> {
        let mut reservoirs = vec![];
        for (idx, plate) in self.plates.iter().enumerate() {
            if plate.role() == PlateRole::Destination {
                continue;
            }
            reservoirs.extend(
                plate
                    .wells()
                    .iter()
                    .filter(|w| w.is_solvent_only(DMSO))
                    .map(|w| (idx, w.id().to_string())),
            );
        }
        let chunk_limit = self.params().round_down(self.params().max_transfer_volume);
        let droplet = self.params().droplet_size;

        for idx in self.plate_indices(PlateRole::Destination) {
            let used = self.plates[idx]
                .used_wells()
                .map(|w| (w.id().to_string(), w.total_volume()))
                .collect::<Vec<_>>();
            let Some(max) = used.iter().map(|(_, v)| *v).reduce(f64::max) else {
                continue;
            };
            for (well_id, volume) in used {
                let mut deficit = self.params().round_down(max - volume);
                while deficit >= droplet - VOLUME_EPSILON {
                    let chunk = deficit.min(chunk_limit);
                    let Some(source) = self.next_solvent_well(&reservoirs, chunk) else {
                        let barcode = self.plates[idx].barcode().to_string();
                        self.allocation_warning(format!(
                            "DMSO reservoirs exhausted while normalising {barcode}:{well_id}, {deficit} nL short"
                        ));
                        break;
                    };
                    self.transfer(&source, (idx, well_id.as_str()), chunk, TransferStage::SolventBackfill, None)?;
                    deficit -= chunk;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pre_calculator::EchoPreCalculator;

    const DOSE_INPUT: &str = r#"{
        "common": {"dest_replicates": 2},
        "patterns": [
            {"name": "Dose", "type": "Treatment", "directions": ["LR"], "replicates": 2,
             "concentrations": [10.0, 1.0, 0.1, 0.01]},
            {"name": "Ctrl", "type": "Control", "replicates": 4, "concentrations": [5.0]},
            {"name": "DMSO", "type": "Solvent"},
            {"name": "Edge", "type": "Unused"}
        ],
        "layout": [
            {"pattern": "Dose", "well_block": "A01:B04;A05:B08"},
            {"pattern": "Ctrl", "well_block": "O01:O04"},
            {"pattern": "Edge", "well_block": "P01:P24"}
        ],
        "compounds": [
            {"barcode": "SRC1", "well": "A01", "compound_id": "CPD-1",
             "concentration": 10000.0, "volume": 60.0, "patterns": "Dose"},
            {"barcode": "SRC1", "well": "A02", "compound_id": "CPD-2",
             "concentration": 10000.0, "volume": 60.0, "patterns": "Dose"},
            {"barcode": "SRC1", "well": "A03", "compound_id": "CTRL",
             "concentration": 1000.0, "volume": 60.0, "patterns": "Ctrl"},
            {"barcode": "SRC1", "well": "P01:P24", "compound_id": "DMSO",
             "volume": 50.0, "patterns": "DMSO"}
        ]
    }"#;

    const COMBO_INPUT: &str = r#"{
        "patterns": [
            {"name": "Combo", "type": "Combination", "directions": ["LR", "TB"],
             "concentrations": [2.0, 1.0]}
        ],
        "layout": [{"pattern": "Combo", "well_block": "A01:B02"}],
        "compounds": [
            {"barcode": "SRC1", "well": "A01", "compound_id": "X",
             "concentration": 10000.0, "volume": 10.0, "patterns": "Combo"},
            {"barcode": "SRC1", "well": "A02", "compound_id": "Y",
             "concentration": 10000.0, "volume": 10.0, "patterns": "Combo"},
            {"barcode": "SRC1", "well": "A03", "compound_id": "Z",
             "concentration": 10000.0, "volume": 10.0, "patterns": "Combo"}
        ]
    }"#;

    const CONTROLS_INPUT: &str = r#"{
        "patterns": [
            {"name": "Ctrl", "type": "Control", "replicates": 2, "concentrations": [5.0]}
        ],
        "layout": [{"pattern": "Ctrl", "well_block": "A01:A02;A03:A04;A05:A06"}],
        "compounds": [
            {"barcode": "SRC1", "well": "A01", "compound_id": "K1",
             "concentration": 1000.0, "volume": 20.0, "patterns": "Ctrl"},
            {"barcode": "SRC1", "well": "A02", "compound_id": "K2",
             "concentration": 1000.0, "volume": 20.0, "patterns": "Ctrl"}
        ]
    }"#;

    // 5 and 1 µM from 1000 µM are direct 125 and 25 nL transfers.
    const BACKFILL_INPUT: &str = r#"{
        "common": {"dmso_normalization": true},
        "patterns": [
            {"name": "Dose", "type": "Treatment", "directions": ["LR"], "concentrations": [5.0, 1.0]}
        ],
        "layout": [{"pattern": "Dose", "well_block": "A01:A02"}],
        "compounds": [
            {"barcode": "SRC1", "well": "A01", "compound_id": "CPD-1",
             "concentration": 1000.0, "volume": 20.0, "patterns": "Dose"}
        ]
    }"#;

    // The only reservoir holds 50 nL above the 2.5 µL dead volume.
    const SHORT_RESERVOIR_INPUT: &str = r#"{
        "common": {"dmso_normalization": true, "create_int_concs": false,
                   "intermediate_backfill_volume": 0.0},
        "patterns": [
            {"name": "Dose", "type": "Treatment", "directions": ["LR"],
             "concentrations": [5.0, 1.0, 4.0]},
            {"name": "DMSO", "type": "Solvent"}
        ],
        "layout": [{"pattern": "Dose", "well_block": "A01:A03"}],
        "compounds": [
            {"barcode": "SRC1", "well": "A01", "compound_id": "CPD-1",
             "concentration": 1000.0, "volume": 10.0, "patterns": "Dose"},
            {"barcode": "SRC1", "well": "P01", "compound_id": "DMSO",
             "volume": 2.55, "patterns": "DMSO"}
        ]
    }"#;

    fn plan(json: &str) -> (PlanInput, EchoResult) {
        let input = PlanInput::from_json_str(json).unwrap();
        let pre = EchoPreCalculator::new(input.clone()).run();
        let result = EchoCalculator::new(&input, &pre).unwrap().run().unwrap();
        (input, result)
    }

    fn assay_conc(result: &EchoResult, barcode: &str, well_id: &str, compound: &str) -> f64 {
        result
            .plate(barcode)
            .unwrap()
            .get_well(well_id)
            .unwrap()
            .assay_concentration(compound, 25_000.0)
            .unwrap()
    }

    #[test]
    fn test_dose_response_plan() {
        let (_, result) = plan(DOSE_INPUT);
        assert_eq!(
            result.checkpoints.status(CHECKPOINT_ALLOCATION),
            Some(CheckpointStatus::Passed)
        );
        assert_eq!(result.plates_with_role(PlateRole::Source).count(), 1);
        assert_eq!(result.plates_with_role(PlateRole::Intermediate1).count(), 1);
        assert_eq!(result.plates_with_role(PlateRole::Destination).count(), 2);
        assert!(result.plate("IntPlate_1").is_some());

        let staged = result.staged_transfers();
        assert_eq!(staged[&TransferStage::SourceToInt1].len(), 2);
        assert_eq!(staged[&TransferStage::SourceToDest].len(), 24);
        assert_eq!(staged[&TransferStage::Int1ToDest].len(), 16);
        assert!(!staged.contains_key(&TransferStage::SolventBackfill));
        assert_eq!(result.transfers.len(), 42);

        for barcode in ["DestPlate_1", "DestPlate_2"] {
            assert_eq!(assay_conc(&result, barcode, "A01", "CPD-1"), 10.0);
            assert_eq!(assay_conc(&result, barcode, "B02", "CPD-1"), 1.0);
            assert_eq!(assay_conc(&result, barcode, "A05", "CPD-2"), 10.0);
            let low = assay_conc(&result, barcode, "A04", "CPD-1");
            assert!((low - 0.01).abs() <= 0.001, "{low}");
            assert_eq!(assay_conc(&result, barcode, "O01", "CTRL"), 5.0);
            let plate = result.plate(barcode).unwrap();
            assert!(plate.get_well("P01").unwrap().is_unused());
            assert_eq!(plate.metadata[crate::plate::META_MAX_ASSAY_CONCENTRATION], serde_json::json!(10.0));
        }
    }

    #[test]
    fn test_steps_come_in_stage_order() {
        let (_, result) = plan(DOSE_INPUT);
        let staged = result.staged_transfers();
        let stages = staged.keys().copied().collect::<Vec<_>>();
        assert_eq!(
            stages,
            vec![
                TransferStage::SourceToInt1,
                TransferStage::SourceToDest,
                TransferStage::Int1ToDest
            ]
        );
        for step in &staged[&TransferStage::Int1ToDest] {
            assert_eq!(step.source_barcode, "IntPlate_1");
        }
    }

    #[test]
    fn test_dead_volume_is_never_drawn() {
        let json = DOSE_INPUT.replacen(r#""volume": 60.0"#, r#""volume": 15.1"#, 1);
        let (input, result) = plan(&json);
        assert_eq!(
            result.checkpoints.status(CHECKPOINT_ALLOCATION),
            Some(CheckpointStatus::Warning)
        );
        let source = result.plate("SRC1").unwrap();
        for (_, loc) in input.inventory.unique_locations() {
            let well = source.get_well(&loc.well_id).unwrap();
            assert!(well.total_volume() >= 15_000.0 - 1e-9, "{}", loc.well_id);
        }
        let message = &result.checkpoints.get(CHECKPOINT_ALLOCATION).unwrap().messages[0];
        assert!(message.contains("CPD-1"));
    }

    #[test]
    fn test_failed_precalc_blocks_allocation() {
        let json = DOSE_INPUT.replace(r#"{"pattern": "Dose", "well_block": "A01:B04;A05:B08"},"#, "");
        let input = PlanInput::from_json_str(&json).unwrap();
        let pre = EchoPreCalculator::new(input.clone()).run();
        assert!(matches!(
            EchoCalculator::new(&input, &pre),
            Err(EchoError::CheckpointFailed(_))
        ));
    }

    #[test]
    fn test_declared_barcodes_come_first() {
        let json = DOSE_INPUT.replacen(
            r#""common""#,
            r#""barcodes": [{"intermediate": "INT-A", "destination": "DEST-A"}],
            "common""#,
            1,
        );
        let (_, result) = plan(&json);
        assert!(result.plate("INT-A").is_some());
        assert!(result.plate("DEST-A").is_some());
        assert!(result.plate("DestPlate_2").is_some());
    }

    #[test]
    fn test_dmso_normalization_levels_volumes() {
        let json = DOSE_INPUT.replace(
            r#""dest_replicates": 2"#,
            r#""dest_replicates": 2, "dmso_normalization": true"#,
        );
        let (_, result) = plan(&json);
        let staged = result.staged_transfers();
        assert!(!staged[&TransferStage::SolventBackfill].is_empty());
        for plate in result.plates_with_role(PlateRole::Destination) {
            for well in plate.used_wells() {
                assert!((well.total_volume() - 125.0).abs() < 1e-9, "{}", well.id());
            }
        }
        assert_eq!(
            result.checkpoints.status(CHECKPOINT_ALLOCATION),
            Some(CheckpointStatus::Passed)
        );
    }

    #[test]
    fn test_combination_blocks() {
        let (_, result) = plan(COMBO_INPUT);
        assert_eq!(result.plates_with_role(PlateRole::Destination).count(), 3);
        let expected = [("DestPlate_1", "X", "Y"), ("DestPlate_2", "X", "Z"), ("DestPlate_3", "Y", "Z")];
        for (barcode, first, second) in expected {
            assert_eq!(assay_conc(&result, barcode, "A01", first), 2.0);
            assert_eq!(assay_conc(&result, barcode, "A01", second), 2.0);
            assert!((assay_conc(&result, barcode, "A02", first) - 1.0).abs() < 1e-9);
            assert!((assay_conc(&result, barcode, "A02", second) - 2.0).abs() < 1e-9);
            assert!((assay_conc(&result, barcode, "B01", first) - 2.0).abs() < 1e-9);
            assert!((assay_conc(&result, barcode, "B01", second) - 1.0).abs() < 1e-9);
        }
        assert_eq!(result.transfers.len(), 24);
    }

    #[test]
    fn test_find_next_available_block_consumes_in_order() {
        let input = PlanInput::from_json_str(DOSE_INPUT).unwrap();
        let pre = EchoPreCalculator::new(input.clone()).run();
        let mut calc = EchoCalculator::new(&input, &pre).unwrap();
        calc.add_plate("D1", PlateRole::Destination, PlateSize::Wells384);
        calc.add_plate("D2", PlateRole::Destination, PlateSize::Wells384);
        let dose = input.pattern("Dose").unwrap().clone();
        assert_eq!(calc.find_next_available_block(&dose, 0..2), Some((0, "A01:B04".to_string())));
        assert_eq!(calc.find_next_available_block(&dose, 0..2), Some((0, "A05:B08".to_string())));
        assert_eq!(calc.find_next_available_block(&dose, 0..2), Some((1, "A01:B04".to_string())));
        calc.plates[1].apply_pattern("A05:B08", &dose).unwrap();
        calc.pattern_location_cache.clear();
        assert_eq!(calc.find_next_available_block(&dose, 0..2), Some((0, "A01:B04".to_string())));
        assert_eq!(calc.find_next_available_block(&dose, 1..2), Some((1, "A01:B04".to_string())));
    }

    #[test]
    fn test_controls_rotate_through_compounds() {
        let (_, result) = plan(CONTROLS_INPUT);
        assert_eq!(
            result.checkpoints.status(CHECKPOINT_ALLOCATION),
            Some(CheckpointStatus::Passed)
        );
        let expected = [("A01", "K1"), ("A02", "K1"), ("A03", "K2"), ("A04", "K2"), ("A05", "K1"), ("A06", "K1")];
        let dest = result.plate("DestPlate_1").unwrap();
        for (well_id, compound) in expected {
            assert_eq!(assay_conc(&result, "DestPlate_1", well_id, compound), 5.0);
            assert_eq!(dest.get_well(well_id).unwrap().contents().len(), 1, "{well_id}");
        }
        assert_eq!(result.transfers.len(), 6);
    }

    #[test]
    fn test_backfill_wells_added_when_source_has_no_dmso() {
        let plain = BACKFILL_INPUT.replace(r#""dmso_normalization": true"#, r#""dmso_normalization": false"#);
        let (_, result) = plan(&plain);
        assert_eq!(result.plates_with_role(PlateRole::Intermediate1).count(), 0);

        let (_, result) = plan(BACKFILL_INPUT);
        assert_eq!(result.plates_with_role(PlateRole::Intermediate1).count(), 1);
        let staged = result.staged_transfers();
        assert!(!staged.contains_key(&TransferStage::SourceToInt1));
        let backfill = &staged[&TransferStage::SolventBackfill];
        assert_eq!(backfill.len(), 1);
        assert_eq!(backfill[0].source_barcode, "IntPlate_1");
        let dest = result.plate("DestPlate_1").unwrap();
        for well_id in ["A01", "A02"] {
            assert!((dest.get_well(well_id).unwrap().total_volume() - 125.0).abs() < 1e-9);
        }
        assert_eq!(
            result.checkpoints.status(CHECKPOINT_ALLOCATION),
            Some(CheckpointStatus::Passed)
        );
    }

    #[test]
    fn test_exhausted_reservoir_warns_and_serves_smaller_deficits() {
        let (_, result) = plan(SHORT_RESERVOIR_INPUT);
        assert_eq!(result.plates_with_role(PlateRole::Intermediate1).count(), 0);
        assert_eq!(
            result.checkpoints.status(CHECKPOINT_ALLOCATION),
            Some(CheckpointStatus::Warning)
        );
        let messages = &result.checkpoints.get(CHECKPOINT_ALLOCATION).unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("DestPlate_1:A02"), "{}", messages[0]);

        let dest = result.plate("DestPlate_1").unwrap();
        let volume = |well_id: &str| dest.get_well(well_id).unwrap().total_volume();
        assert!((volume("A01") - 125.0).abs() < 1e-9);
        assert!((volume("A02") - 25.0).abs() < 1e-9);
        assert!((volume("A03") - 125.0).abs() < 1e-9);
        let backfill = &result.staged_transfers()[&TransferStage::SolventBackfill];
        assert_eq!(backfill.len(), 1);
        assert_eq!(backfill[0].source_well_id, "P01");
    }
}
