//! Feasibility pre-calculation: which targets are reachable, how much
//! liquid and how many intermediate wells they take, and whether the stock
//! covers it. Results are reported through four checkpoints; problems
//! inside a checkpoint are recorded there instead of aborting the run.

use crate::config::EchoParameters;
use crate::error::{EchoError, Result};
use crate::input::PlanInput;
use crate::pattern::Pattern;
use crate::solver::{ConcKey, ConcentrationPlan, IntermediateRecipe, SourceType, solve_concentrations};
use crate::well_block::get_some_wells_coords;
use echo_protocol::{CheckpointTracker, PatternType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

pub const CHECKPOINT_PATTERN_ANALYSIS: &str = "Pattern Analysis";
pub const CHECKPOINT_SOURCE_INVENTORY: &str = "Source Inventory";
pub const CHECKPOINT_TRANSFER_VOLUMES: &str = "Transfer Volume Calculation";
pub const CHECKPOINT_SOURCE_VOLUMES: &str = "Source Volume Sufficiency";

pub type NeedKey = (SourceType, ConcKey);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferCacheKey {
    targets: Vec<ConcKey>,
    sources: Vec<ConcKey>,
    fold: usize,
}

impl TransferCacheKey {
    pub fn new(targets: &[f64], sources: &[f64], fold: usize) -> Self {
        let mut targets = targets.iter().map(|c| ConcKey::new(*c)).collect::<Vec<_>>();
        targets.sort();
        targets.dedup();
        let mut sources = sources.iter().map(|c| ConcKey::new(*c)).collect::<Vec<_>>();
        sources.sort();
        sources.dedup();
        Self {
            targets,
            sources,
            fold,
        }
    }
}

/// Volume and intermediate-well needs of one compound in one pattern.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternVolumes {
    pub wells_per_concentration: usize,
    /// Volume drawn straight into destination wells, per source.
    pub direct_needs: BTreeMap<NeedKey, f64>,
    /// `direct_needs` plus what synthesising intermediates draws upstream.
    pub needs: BTreeMap<NeedKey, f64>,
    pub intermediate_wells: BTreeMap<NeedKey, usize>,
}

/// Aggregated demand on one intermediate concentration of one compound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateDemand {
    pub compound_id: String,
    pub recipe: IntermediateRecipe,
    pub volume: f64,
    pub wells: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsatisfiedTarget {
    pub compound_id: String,
    pub pattern: String,
    pub concentration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreCalcResult {
    pub dead_volumes: BTreeMap<String, f64>,
    pub plans: BTreeMap<String, BTreeMap<String, ConcentrationPlan>>,
    #[serde(skip)]
    pub pattern_volumes: BTreeMap<String, BTreeMap<String, PatternVolumes>>,
    pub intermediate_demand: Vec<IntermediateDemand>,
    pub int1_wells: usize,
    pub int2_wells: usize,
    pub destination_plates_per_group: usize,
    pub destination_plates_count: usize,
    pub total_dmso_backfill_vol: f64,
    pub unsatisfied: Vec<UnsatisfiedTarget>,
    pub checkpoints: CheckpointTracker,
}

impl PreCalcResult {
    pub fn plan(&self, compound_id: &str, pattern: &str) -> Option<&ConcentrationPlan> {
        self.plans.get(compound_id).and_then(|p| p.get(pattern))
    }

    pub fn dead_volume(&self, barcode: &str) -> f64 {
        self.dead_volumes.get(barcode).copied().unwrap_or(0.0)
    }

    pub fn can_allocate(&self) -> bool {
        !self.checkpoints.has_failures()
    }
}

pub fn n_choose_r(n: usize, r: usize) -> usize {
    if r > n {
        return 0;
    }
    let r = r.min(n - r);
    let mut acc: u128 = 1;
    for i in 0..r {
        acc = acc * (n - i) as u128 / (i + 1) as u128;
    }
    usize::try_from(acc).unwrap_or(usize::MAX)
}

/// Intermediate wells needed to serve `demand` nL, and what filling them
/// draws from the recipe's source.
fn intermediate_wells_for(
    params: &EchoParameters,
    recipe: &IntermediateRecipe,
    demand: f64,
) -> Result<(usize, f64)> {
    if demand <= 0.0 {
        return Ok((0, 0.0));
    }
    let usable = recipe.fill_volume() - params.intermediate_dead_volume();
    if usable <= 0.0 {
        return Err(EchoError::InvalidInput(format!(
            "Intermediate wells hold {} nL, less than their {} nL dead volume",
            recipe.fill_volume(),
            params.intermediate_dead_volume()
        )));
    }
    let wells = (demand / usable).ceil() as usize;
    Ok((wells, wells as f64 * recipe.vol_to_transfer))
}

/// Adds the upstream volume intermediate synthesis needs, level 2 first.
fn back_propagate(
    params: &EchoParameters,
    needs: &mut BTreeMap<NeedKey, f64>,
    recipes: &[IntermediateRecipe],
) -> Result<BTreeMap<NeedKey, usize>> {
    let mut wells = BTreeMap::new();
    for level in [SourceType::Int2, SourceType::Int1] {
        for recipe in recipes.iter().filter(|r| r.level == level) {
            let demand = needs.get(&recipe.key()).copied().unwrap_or(0.0);
            let (count, upstream) = intermediate_wells_for(params, recipe, demand)?;
            if count == 0 {
                continue;
            }
            wells.insert(recipe.key(), count);
            *needs
                .entry((recipe.source_type, ConcKey::new(recipe.source_conc)))
                .or_default() += upstream;
        }
    }
    Ok(wells)
}

pub struct EchoPreCalculator {
    input: PlanInput,
    dead_volumes: BTreeMap<String, f64>,
    concentration_cache: HashMap<TransferCacheKey, ConcentrationPlan>,
}

impl EchoPreCalculator {
    pub fn new(input: PlanInput) -> Self {
        let dead_volumes = input.inventory.derive_dead_volumes();
        Self {
            input,
            dead_volumes,
            concentration_cache: HashMap::new(),
        }
    }

    pub fn input(&self) -> &PlanInput {
        &self.input
    }

    pub fn params(&self) -> &EchoParameters {
        &self.input.params
    }

    pub fn dead_volumes(&self) -> &BTreeMap<String, f64> {
        &self.dead_volumes
    }

    pub fn cache_len(&self) -> usize {
        self.concentration_cache.len()
    }

    /// Overrides one plate's dead volume and recomputes everything that
    /// depends on it. Concentration recipes do not, so their cache stays.
    pub fn update_dead_volume(&mut self, barcode: &str, volume: f64) -> Result<PreCalcResult> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(EchoError::InvalidInput(format!(
                "Dead volume for '{barcode}' must be non-negative, got {volume}"
            )));
        }
        let entry = self
            .dead_volumes
            .get_mut(barcode)
            .ok_or_else(|| EchoError::InvalidInput(format!("Unknown source plate '{barcode}'")))?;
        *entry = volume;
        info!("dead volume of {barcode} set to {volume} nL");
        Ok(self.run())
    }

    /// Recipes for one compound in one pattern, memoised on the targets,
    /// the available stock concentrations and the combination fold.
    pub fn calculate_transfer_concentrations(
        &mut self,
        pattern: &Pattern,
        compound_id: &str,
    ) -> ConcentrationPlan {
        let targets = pattern.defined_concentrations();
        let stocks = self.input.inventory.source_concentrations(compound_id);
        let fold = pattern.fold_count();
        let key = TransferCacheKey::new(&targets, &stocks, fold);
        if let Some(plan) = self.concentration_cache.get(&key) {
            return plan.clone();
        }
        let plan = solve_concentrations(&self.input.params, &targets, &stocks, fold);
        self.concentration_cache.insert(key, plan.clone());
        plan
    }

    pub fn run(&mut self) -> PreCalcResult {
        info!(
            "pre-calculation: {} pattern(s), {} compound(s)",
            self.input.patterns.len(),
            self.input.inventory.compound_ids().count()
        );
        let mut tracker = CheckpointTracker::with_checkpoints(&[
            CHECKPOINT_PATTERN_ANALYSIS,
            CHECKPOINT_SOURCE_INVENTORY,
            CHECKPOINT_TRANSFER_VOLUMES,
            CHECKPOINT_SOURCE_VOLUMES,
        ]);
        let mut result = PreCalcResult {
            dead_volumes: self.dead_volumes.clone(),
            ..PreCalcResult::default()
        };

        match self.analyze_patterns(&mut tracker) {
            Ok(per_group) => {
                result.destination_plates_per_group = per_group;
                tracker.pass(CHECKPOINT_PATTERN_ANALYSIS);
            }
            Err(e) => {
                tracker.fail(CHECKPOINT_PATTERN_ANALYSIS, e.to_string());
                result.destination_plates_per_group = 1;
            }
        }
        result.destination_plates_count =
            result.destination_plates_per_group * self.input.params.dest_replicates;

        match self.check_inventory(&mut tracker) {
            Ok(()) => tracker.pass(CHECKPOINT_SOURCE_INVENTORY),
            Err(e) => tracker.fail(CHECKPOINT_SOURCE_INVENTORY, e.to_string()),
        }

        match self.calculate_transfer_volumes(&mut result, &mut tracker) {
            Ok(()) => tracker.pass(CHECKPOINT_TRANSFER_VOLUMES),
            Err(e) => tracker.fail(CHECKPOINT_TRANSFER_VOLUMES, e.to_string()),
        }

        match self.check_source_volumes(&result, &mut tracker) {
            Ok(()) => tracker.pass(CHECKPOINT_SOURCE_VOLUMES),
            Err(e) => tracker.fail(CHECKPOINT_SOURCE_VOLUMES, e.to_string()),
        }

        result.checkpoints = tracker;
        result
    }

    fn compounds_for(&self, pattern: &Pattern) -> Vec<String> {
        self.input
            .inventory
            .compounds_with_pattern(&pattern.name)
            .into_iter()
            .filter(|c| !self.input.is_solvent_compound(c))
            .collect()
    }

    /// Validates patterns against the layout and returns how many
    /// destination plates one replicate group needs.
    fn analyze_patterns(&self, tracker: &mut CheckpointTracker) -> Result<usize> {
        const NAME: &str = CHECKPOINT_PATTERN_ANALYSIS;
        let dest_size = self.input.params.destination_plate_size;
        let mut claimed: HashMap<(usize, usize), String> = HashMap::new();
        for block in &self.input.layout {
            for coords in get_some_wells_coords(&block.block)? {
                if coords.0 >= dest_size.rows() || coords.1 >= dest_size.columns() {
                    return Err(EchoError::InvalidInput(format!(
                        "Layout block {} of pattern '{}' does not fit a {}-well destination plate",
                        block.block,
                        block.pattern,
                        dest_size.well_count()
                    )));
                }
                if let Some(other) = claimed.insert(coords, block.pattern.clone()) {
                    if other != block.pattern {
                        tracker.warn(
                            NAME,
                            format!(
                                "Layout blocks of '{}' and '{}' overlap at {}",
                                other,
                                block.pattern,
                                crate::well_block::well_id_from_coords(coords.0, coords.1)
                            ),
                        );
                    }
                }
            }
        }

        let mut per_group = 1;
        for pattern in self.input.ordered_patterns() {
            if !pattern.pattern_type.carries_concentrations() {
                continue;
            }
            let compounds = self.compounds_for(pattern);
            let blocks = self.input.layout_blocks(&pattern.name);
            if pattern.defined_concentrations().is_empty() {
                return Err(EchoError::InvalidInput(format!(
                    "Pattern '{}' has no concentrations",
                    pattern.name
                )));
            }
            for (slot, conc) in pattern.concentrations.iter().enumerate() {
                if conc.is_none() {
                    tracker.warn(
                        NAME,
                        format!("Pattern '{}' slot {} has no concentration", pattern.name, slot + 1),
                    );
                }
            }
            if compounds.is_empty() {
                tracker.warn(NAME, format!("Pattern '{}' is not used by any compound", pattern.name));
                continue;
            }
            if blocks.is_empty() {
                return Err(EchoError::InvalidInput(format!(
                    "Pattern '{}' is used by {} compound(s) but has no layout block",
                    pattern.name,
                    compounds.len()
                )));
            }
            for block in &blocks {
                let wells = get_some_wells_coords(block)?.len();
                if wells != pattern.block_size() {
                    tracker.warn(
                        NAME,
                        format!(
                            "Block {block} of pattern '{}' has {wells} wells, expected {}",
                            pattern.name,
                            pattern.block_size()
                        ),
                    );
                }
            }
            let needed = match pattern.pattern_type {
                PatternType::Treatment => compounds.len().div_ceil(blocks.len()),
                PatternType::Combination => {
                    let fold = pattern.fold_count();
                    if compounds.len() < fold {
                        tracker.warn(
                            NAME,
                            format!(
                                "Combination pattern '{}' needs {fold} compounds, only {} assigned",
                                pattern.name,
                                compounds.len()
                            ),
                        );
                    }
                    n_choose_r(compounds.len(), fold).div_ceil(blocks.len())
                }
                _ => 1,
            };
            per_group = per_group.max(needed);
        }
        debug!("{per_group} destination plate(s) per replicate group");
        Ok(per_group)
    }

    fn check_inventory(&self, tracker: &mut CheckpointTracker) -> Result<()> {
        const NAME: &str = CHECKPOINT_SOURCE_INVENTORY;
        let inventory = &self.input.inventory;
        if inventory.is_empty() {
            return Err(EchoError::InvalidInput("No source compounds supplied".to_string()));
        }
        for compound in inventory.compound_ids() {
            let usable: f64 = inventory
                .unique_locations()
                .iter()
                .filter(|(c, _)| c == compound)
                .map(|(_, loc)| (loc.volume - self.dead_volumes.get(&loc.barcode).copied().unwrap_or(0.0)).max(0.0))
                .sum();
            if usable <= 0.0 {
                tracker.warn(
                    NAME,
                    format!("Compound {compound} has no volume above the plates' dead volume"),
                );
            }
        }
        for (barcode, dead) in &self.dead_volumes {
            tracker.add_message(NAME, format!("Plate {barcode}: dead volume {dead} nL"));
        }
        Ok(())
    }

    /// Destination wells each concentration slot of `pattern` fills for one compound.
    fn wells_per_concentration(&self, pattern: &Pattern, compound_count: usize, dest_plates: usize) -> usize {
        let replicate_groups = self.input.params.dest_replicates;
        let uses = match pattern.pattern_type {
            PatternType::Treatment => replicate_groups,
            PatternType::Combination => {
                let fold = pattern.fold_count();
                n_choose_r(compound_count.saturating_sub(1), fold.saturating_sub(1)) * replicate_groups
            }
            PatternType::Control => {
                let slots = self.input.layout_blocks(&pattern.name).len() * dest_plates;
                slots.div_ceil(compound_count.max(1))
            }
            PatternType::Solvent | PatternType::Unused => 0,
        };
        uses * pattern.replicates * self.combination_cells(pattern)
    }

    /// Wells per slot inside one combination block come from the other axes.
    fn combination_cells(&self, pattern: &Pattern) -> usize {
        match pattern.pattern_type {
            PatternType::Combination => pattern
                .slot_count()
                .saturating_pow(u32::try_from(pattern.fold_count().saturating_sub(1)).unwrap_or(u32::MAX))
                .max(1),
            _ => 1,
        }
    }

    fn calculate_transfer_volumes(
        &mut self,
        result: &mut PreCalcResult,
        tracker: &mut CheckpointTracker,
    ) -> Result<()> {
        const NAME: &str = CHECKPOINT_TRANSFER_VOLUMES;
        let params = self.input.params.clone();
        let patterns = self.input.ordered_patterns().cloned().collect::<Vec<_>>();
        let mut aggregated: BTreeMap<String, (BTreeMap<NeedKey, f64>, Vec<IntermediateRecipe>)> =
            BTreeMap::new();

        for pattern in &patterns {
            if !pattern.pattern_type.carries_concentrations() {
                continue;
            }
            let compounds = self.compounds_for(pattern);
            for compound in &compounds {
                let plan = self.calculate_transfer_concentrations(pattern, compound);
                for target in &plan.unsatisfied {
                    tracker.warn(
                        NAME,
                        format!(
                            "Compound {compound} in pattern '{}': {target} µM cannot be reached within ±{}%",
                            pattern.name,
                            params.allowable_error * 100.0
                        ),
                    );
                    result.unsatisfied.push(UnsatisfiedTarget {
                        compound_id: compound.clone(),
                        pattern: pattern.name.clone(),
                        concentration: *target,
                    });
                }

                let wells = self.wells_per_concentration(pattern, compounds.len(), result.destination_plates_count);
                let mut volumes = PatternVolumes {
                    wells_per_concentration: wells,
                    ..PatternVolumes::default()
                };
                for target in pattern.defined_concentrations() {
                    if let Some(obj) = plan.get(target) {
                        *volumes
                            .direct_needs
                            .entry((obj.source_type, ConcKey::new(obj.source_conc)))
                            .or_default() += obj.vol_to_transfer * wells as f64;
                        if params.dmso_normalization {
                            let headroom = params.max_destination_transfer(pattern.fold_count()) - obj.vol_to_transfer;
                            result.total_dmso_backfill_vol += headroom.max(0.0) * wells as f64;
                        }
                    }
                }
                volumes.needs = volumes.direct_needs.clone();
                volumes.intermediate_wells =
                    back_propagate(&params, &mut volumes.needs, &plan.intermediates)?;

                let entry = aggregated.entry(compound.clone()).or_default();
                for (key, volume) in &volumes.direct_needs {
                    *entry.0.entry(*key).or_default() += volume;
                }
                for recipe in &plan.intermediates {
                    if !entry.1.iter().any(|r| r.key() == recipe.key()) {
                        entry.1.push(*recipe);
                    }
                }

                result
                    .plans
                    .entry(compound.clone())
                    .or_default()
                    .insert(pattern.name.clone(), plan);
                result
                    .pattern_volumes
                    .entry(compound.clone())
                    .or_default()
                    .insert(pattern.name.clone(), volumes);
            }
        }

        for (compound, (mut needs, recipes)) in aggregated {
            let wells = back_propagate(&params, &mut needs, &recipes)?;
            for recipe in &recipes {
                let Some(count) = wells.get(&recipe.key()).copied() else {
                    continue;
                };
                match recipe.level {
                    SourceType::Int2 => result.int2_wells += count,
                    _ => result.int1_wells += count,
                }
                result.intermediate_demand.push(IntermediateDemand {
                    compound_id: compound.clone(),
                    recipe: *recipe,
                    volume: needs.get(&recipe.key()).copied().unwrap_or(0.0),
                    wells: count,
                });
            }
        }
        info!(
            "{} level-1 and {} level-2 intermediate well(s), {} destination plate(s)",
            result.int1_wells, result.int2_wells, result.destination_plates_count
        );
        Ok(())
    }

    fn check_source_volumes(&self, result: &PreCalcResult, tracker: &mut CheckpointTracker) -> Result<()> {
        const NAME: &str = CHECKPOINT_SOURCE_VOLUMES;
        let locations = self.input.inventory.unique_locations();
        let mut committed: HashMap<(String, ConcKey), f64> = HashMap::new();
        let mut warned: HashSet<(String, String, ConcKey)> = HashSet::new();

        for pattern in self.input.ordered_patterns() {
            for (compound, by_pattern) in &result.pattern_volumes {
                let Some(volumes) = by_pattern.get(&pattern.name) else {
                    continue;
                };
                for ((source_type, conc), required) in &volumes.needs {
                    if *source_type != SourceType::Src || *required <= 0.0 {
                        continue;
                    }
                    let available: f64 = locations
                        .iter()
                        .filter(|(c, loc)| c == compound && ConcKey::new(loc.concentration) == *conc)
                        .map(|(_, loc)| (loc.volume - result.dead_volume(&loc.barcode)).max(0.0))
                        .sum();
                    let used = committed.entry((compound.clone(), *conc)).or_default();
                    let uncommitted = available - *used;
                    if uncommitted + 1e-9 < *required
                        && warned.insert((compound.clone(), pattern.name.clone(), *conc))
                    {
                        warn!("{compound} short of {} µM stock for '{}'", conc.value(), pattern.name);
                        tracker.warn(
                            NAME,
                            format!(
                                "Compound {compound}, pattern '{}', {} µM stock: requires {:.1} nL, available {:.1} nL, uncommitted {:.1} nL",
                                pattern.name,
                                conc.value(),
                                required,
                                available,
                                uncommitted.max(0.0)
                            ),
                        );
                    }
                    *used += required;
                }
            }
        }
        Ok(())
    }
}
