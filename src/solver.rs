//! Concentration feasibility search.
//!
//! For one compound and one list of target concentrations, finds droplet-
//! quantised transfer volumes that land within the allowable error, first
//! straight from stock and then through up to two synthesised intermediate
//! dilutions. The intermediate search is a heuristic: accepted recipes meet
//! the tolerance, but they are not guaranteed to be the best ones.

use crate::config::EchoParameters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const CONC_SCALE: f64 = 1e9;
const VOLUME_EPSILON: f64 = 1e-9;

/// A concentration (µM) quantised so it can serve as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConcKey(i64);

impl ConcKey {
    pub fn new(concentration: f64) -> Self {
        Self((concentration * CONC_SCALE).round() as i64)
    }

    pub fn value(self) -> f64 {
        self.0 as f64 / CONC_SCALE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceType {
    Src,
    Int1,
    Int2,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Int1 => "int1",
            Self::Int2 => "int2",
        }
    }

    pub fn is_intermediate(self) -> bool {
        !matches!(self, Self::Src)
    }
}

/// How to reach one target concentration: `vol_to_transfer` nL from a well
/// at `source_conc`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationObj {
    pub source_conc: f64,
    pub source_type: SourceType,
    pub vol_to_transfer: f64,
}

/// An intermediate dilution: `vol_to_transfer` nL from a well at
/// `source_conc` into `backfill_volume` nL of solvent gives `concentration`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntermediateRecipe {
    pub level: SourceType,
    pub concentration: f64,
    pub source_conc: f64,
    pub source_type: SourceType,
    pub vol_to_transfer: f64,
    pub backfill_volume: f64,
}

impl IntermediateRecipe {
    pub fn key(&self) -> (SourceType, ConcKey) {
        (self.level, ConcKey::new(self.concentration))
    }

    /// Liquid an intermediate well holds right after synthesis.
    pub fn fill_volume(&self) -> f64 {
        self.backfill_volume + self.vol_to_transfer
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationPlan {
    pub transfers: BTreeMap<ConcKey, ConcentrationObj>,
    pub intermediates: Vec<IntermediateRecipe>,
    pub unsatisfied: Vec<f64>,
}

impl ConcentrationPlan {
    pub fn get(&self, target: f64) -> Option<&ConcentrationObj> {
        self.transfers.get(&ConcKey::new(target))
    }

    pub fn intermediate(&self, level: SourceType, concentration: f64) -> Option<&IntermediateRecipe> {
        let key = ConcKey::new(concentration);
        self.intermediates
            .iter()
            .find(|r| r.level == level && ConcKey::new(r.concentration) == key)
    }
}

fn within_tolerance(actual: f64, target: f64, allowable_error: f64) -> bool {
    (actual - target).abs() <= target * allowable_error + 1e-12
}

fn sort_descending(values: &mut Vec<f64>) {
    values.sort_by(|a, b| b.total_cmp(a));
    values.dedup_by(|a, b| ConcKey::new(*a) == ConcKey::new(*b));
}

/// Quantised volume moving `source_conc` to within tolerance of `target`
/// in the assay volume, bounded by one droplet and `max_volume`.
pub fn find_transfer_volume(
    params: &EchoParameters,
    source_conc: f64,
    target: f64,
    max_volume: f64,
) -> Option<f64> {
    if source_conc <= 0.0 || target <= 0.0 || max_volume < params.droplet_size {
        return None;
    }
    let ideal = target * params.assay_volume / source_conc;
    let candidates = [
        params.round_nearest(ideal),
        params.round_up(ideal),
        params.round_down(ideal),
        params.round_down(max_volume),
        params.droplet_size,
    ];
    candidates.into_iter().find(|&volume| {
        params.is_quantized(volume)
            && volume >= params.droplet_size - VOLUME_EPSILON
            && volume <= max_volume + VOLUME_EPSILON
            && within_tolerance(
                source_conc * volume / params.assay_volume,
                target,
                params.allowable_error,
            )
    })
}

/// Tries every source (highest first) against every still-open target.
fn direct_pass(
    params: &EchoParameters,
    sources: &[(f64, SourceType)],
    targets: &[f64],
    max_volume: f64,
    satisfied: &mut BTreeMap<ConcKey, ConcentrationObj>,
) {
    for &(source_conc, source_type) in sources {
        for &target in targets {
            let key = ConcKey::new(target);
            if satisfied.contains_key(&key) {
                continue;
            }
            if let Some(volume) = find_transfer_volume(params, source_conc, target, max_volume) {
                satisfied.insert(
                    key,
                    ConcentrationObj {
                        source_conc,
                        source_type,
                        vol_to_transfer: volume,
                    },
                );
            }
        }
    }
}

fn dilute(params: &EchoParameters, source_conc: f64, volume: f64) -> f64 {
    source_conc * volume / (params.backfill_volume + volume)
}

/// Transfer volume (before rounding) turning `source_conc` into `wanted`
/// inside one backfilled intermediate well.
fn volume_for_intermediate(params: &EchoParameters, source_conc: f64, wanted: f64) -> Option<f64> {
    (wanted > 0.0 && wanted < source_conc)
        .then(|| wanted * params.backfill_volume / (source_conc - wanted))
}

/// Runs the direct pass from a single candidate source over the open
/// targets; returns the recipes it would add.
fn trial_from(
    params: &EchoParameters,
    source: (f64, SourceType),
    targets: &[f64],
    max_volume: f64,
    satisfied: &BTreeMap<ConcKey, ConcentrationObj>,
) -> BTreeMap<ConcKey, ConcentrationObj> {
    let open = targets
        .iter()
        .copied()
        .filter(|t| !satisfied.contains_key(&ConcKey::new(*t)))
        .collect::<Vec<_>>();
    let mut trial = BTreeMap::new();
    direct_pass(params, &[source], &open, max_volume, &mut trial);
    trial
}

fn level1_pass(
    params: &EchoParameters,
    stocks: &[f64],
    targets: &[f64],
    max_volume: f64,
    satisfied: &mut BTreeMap<ConcKey, ConcentrationObj>,
    intermediates: &mut Vec<IntermediateRecipe>,
) {
    for &target in targets {
        if satisfied.contains_key(&ConcKey::new(target)) {
            continue;
        }
        for &stock in stocks {
            let ideal_int = target * params.assay_volume / max_volume;
            let Some(ideal_volume) = volume_for_intermediate(params, stock, ideal_int) else {
                continue;
            };
            // Rounding up keeps the intermediate at or above the ideal.
            let volume = params
                .round_up(ideal_volume)
                .max(params.droplet_size)
                .min(params.round_down(params.max_transfer_volume));
            let int_conc = dilute(params, stock, volume);
            let lowest = dilute(params, stock, params.droplet_size);
            let highest = dilute(params, stock, params.max_transfer_volume);
            if int_conc < lowest * (1.0 - 1e-12) || int_conc > highest * (1.0 + 1e-12) {
                continue;
            }
            let trial = trial_from(params, (int_conc, SourceType::Int1), targets, max_volume, satisfied);
            if !trial.contains_key(&ConcKey::new(target)) {
                continue;
            }
            debug!(
                "level-1 intermediate {int_conc:.6} µM from {stock} µM stock ({volume} nL) covers {} target(s)",
                trial.len()
            );
            satisfied.extend(trial);
            intermediates.push(IntermediateRecipe {
                level: SourceType::Int1,
                concentration: int_conc,
                source_conc: stock,
                source_type: SourceType::Src,
                vol_to_transfer: volume,
                backfill_volume: params.backfill_volume,
            });
            break;
        }
    }
}

/// Final-transfer volumes the level-2 search aims for.
fn operating_points(params: &EchoParameters, max_volume: f64) -> [(&'static str, f64); 3] {
    let floor = params.droplet_size;
    [
        ("hi", max_volume),
        ("mid", params.round_down(max_volume / 2.0).max(floor)),
        ("lo", params.round_down(max_volume / 4.0).max(floor)),
    ]
}

fn level2_pass(
    params: &EchoParameters,
    stocks: &[f64],
    targets: &[f64],
    max_volume: f64,
    satisfied: &mut BTreeMap<ConcKey, ConcentrationObj>,
    intermediates: &mut Vec<IntermediateRecipe>,
) {
    for &target in targets {
        if satisfied.contains_key(&ConcKey::new(target)) {
            continue;
        }

        // Existing level-1 intermediates, plus the most dilute one each
        // stock can make, which is only kept if it gets used.
        let mut parents: Vec<(IntermediateRecipe, bool)> = intermediates
            .iter()
            .filter(|r| r.level == SourceType::Int1)
            .map(|r| (*r, true))
            .collect();
        for &stock in stocks {
            let stepping = IntermediateRecipe {
                level: SourceType::Int1,
                concentration: dilute(params, stock, params.droplet_size),
                source_conc: stock,
                source_type: SourceType::Src,
                vol_to_transfer: params.droplet_size,
                backfill_volume: params.backfill_volume,
            };
            if !parents.iter().any(|(r, _)| r.key() == stepping.key()) {
                parents.push((stepping, false));
            }
        }

        let mut candidates: Vec<(f64, usize, f64, &'static str)> = vec![];
        for (idx, (parent, _)) in parents.iter().enumerate() {
            for (label, final_volume) in operating_points(params, max_volume) {
                let wanted = target * params.assay_volume / final_volume;
                let Some(ideal) = volume_for_intermediate(params, parent.concentration, wanted) else {
                    continue;
                };
                let volume = params.round_nearest(ideal);
                if volume < params.droplet_size - VOLUME_EPSILON
                    || volume > params.max_transfer_volume + VOLUME_EPSILON
                {
                    continue;
                }
                let error = (volume - ideal).abs() / ideal;
                candidates.push((error, idx, volume, label));
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (error, idx, volume, label) in candidates {
            let (parent, existing) = parents[idx];
            let int_conc = dilute(params, parent.concentration, volume);
            let trial = trial_from(params, (int_conc, SourceType::Int2), targets, max_volume, satisfied);
            if !trial.contains_key(&ConcKey::new(target)) {
                continue;
            }
            debug!(
                "level-2 intermediate {int_conc:.9} µM via '{label}' point (rounding error {error:.4}) covers {} target(s)",
                trial.len()
            );
            satisfied.extend(trial);
            if !existing {
                intermediates.push(parent);
            }
            intermediates.push(IntermediateRecipe {
                level: SourceType::Int2,
                concentration: int_conc,
                source_conc: parent.concentration,
                source_type: SourceType::Int1,
                vol_to_transfer: volume,
                backfill_volume: params.backfill_volume,
            });
            break;
        }
    }
}

/// Resolves every target it can from the given stock concentrations.
/// `fold` compounds share one destination well's DMSO allowance.
pub fn solve_concentrations(
    params: &EchoParameters,
    targets: &[f64],
    stocks: &[f64],
    fold: usize,
) -> ConcentrationPlan {
    let mut targets = targets.iter().copied().filter(|t| *t > 0.0).collect::<Vec<_>>();
    sort_descending(&mut targets);
    let mut stocks = stocks.iter().copied().filter(|s| *s > 0.0).collect::<Vec<_>>();
    sort_descending(&mut stocks);
    let max_volume = params.max_destination_transfer(fold);

    let mut satisfied = BTreeMap::new();
    let mut intermediates = vec![];
    let sources = stocks
        .iter()
        .map(|s| (*s, SourceType::Src))
        .collect::<Vec<_>>();
    direct_pass(params, &sources, &targets, max_volume, &mut satisfied);

    if params.create_int_concs && max_volume >= params.droplet_size {
        level1_pass(params, &stocks, &targets, max_volume, &mut satisfied, &mut intermediates);
        level2_pass(params, &stocks, &targets, max_volume, &mut satisfied, &mut intermediates);
    }

    let unsatisfied = targets
        .iter()
        .copied()
        .filter(|t| !satisfied.contains_key(&ConcKey::new(*t)))
        .collect();
    ConcentrationPlan {
        transfers: satisfied,
        intermediates,
        unsatisfied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EchoParameters {
        EchoParameters::default()
    }

    fn resulting_concentration(params: &EchoParameters, obj: &ConcentrationObj) -> f64 {
        obj.source_conc * obj.vol_to_transfer / params.assay_volume
    }

    fn assert_recipe_ok(params: &EchoParameters, target: f64, obj: &ConcentrationObj, fold: usize) {
        assert!(params.is_quantized(obj.vol_to_transfer));
        assert!(obj.vol_to_transfer >= params.droplet_size);
        assert!(obj.vol_to_transfer <= params.max_destination_transfer(fold) + 1e-9);
        let actual = resulting_concentration(params, obj);
        assert!(
            (actual - target).abs() <= target * params.allowable_error + 1e-12,
            "target {target}, got {actual}"
        );
    }

    #[test]
    fn test_conc_key() {
        assert_eq!(ConcKey::new(0.1 + 0.2), ConcKey::new(0.3));
        assert!(ConcKey::new(1.0) > ConcKey::new(0.5));
        assert_eq!(ConcKey::new(12.5).value(), 12.5);
    }

    #[test]
    fn test_direct_transfer_within_dmso_ceiling() {
        let params = params();
        let plan = solve_concentrations(&params, &[5.0], &[1000.0], 1);
        let obj = plan.get(5.0).unwrap();
        assert_eq!(obj.source_type, SourceType::Src);
        assert_eq!(obj.vol_to_transfer, 125.0);
        assert!(plan.intermediates.is_empty());
        assert_recipe_ok(&params, 5.0, obj, 1);
    }

    #[test]
    fn test_direct_transfer_from_concentrated_stock() {
        let params = params();
        let plan = solve_concentrations(&params, &[10.0], &[10_000.0], 1);
        let obj = plan.get(10.0).unwrap();
        assert_eq!(obj.source_type, SourceType::Src);
        assert_eq!(obj.vol_to_transfer, 25.0);
    }

    #[test]
    fn test_target_above_dmso_ceiling_is_unsatisfied() {
        let params = params();
        let plan = solve_concentrations(&params, &[10.0], &[1000.0], 1);
        assert!(plan.get(10.0).is_none());
        assert_eq!(plan.unsatisfied, vec![10.0]);
    }

    #[test]
    fn test_uses_highest_stock_that_works() {
        let params = params();
        let plan = solve_concentrations(&params, &[1.0], &[10_000.0, 100.0], 1);
        let obj = plan.get(1.0).unwrap();
        assert_eq!(obj.source_conc, 10_000.0);
        assert_eq!(obj.vol_to_transfer, 2.5);
    }

    #[test]
    fn test_level1_intermediate_for_low_targets() {
        let params = params();
        let plan = solve_concentrations(&params, &[0.01, 0.005], &[1000.0], 1);
        for target in [0.01, 0.005] {
            let obj = plan.get(target).unwrap();
            assert_eq!(obj.source_type, SourceType::Int1);
            assert_recipe_ok(&params, target, obj, 1);
            let recipe = plan.intermediate(SourceType::Int1, obj.source_conc).unwrap();
            assert_eq!(recipe.source_conc, 1000.0);
            assert!(params.is_quantized(recipe.vol_to_transfer));
            let expected = 1000.0 * recipe.vol_to_transfer / recipe.fill_volume();
            assert!((recipe.concentration - expected).abs() < 1e-12);
        }
        // One synthesis serves both targets.
        assert_eq!(plan.intermediates.len(), 1);
    }

    #[test]
    fn test_no_intermediates_when_disabled() {
        let params = EchoParameters {
            create_int_concs: false,
            ..EchoParameters::default()
        };
        let plan = solve_concentrations(&params, &[0.01], &[1000.0], 1);
        assert!(plan.transfers.is_empty());
        assert!(plan.intermediates.is_empty());
        assert_eq!(plan.unsatisfied, vec![0.01]);
    }

    #[test]
    fn test_level2_for_very_low_targets() {
        let params = params();
        let target = 1e-6;
        let plan = solve_concentrations(&params, &[target], &[10_000.0], 1);
        let obj = plan.get(target).unwrap();
        assert_eq!(obj.source_type, SourceType::Int2);
        assert_recipe_ok(&params, target, obj, 1);
        let int2 = plan.intermediate(SourceType::Int2, obj.source_conc).unwrap();
        let int1 = plan.intermediate(SourceType::Int1, int2.source_conc).unwrap();
        assert_eq!(int1.source_type, SourceType::Src);
        assert!(int2.vol_to_transfer >= params.droplet_size);
        assert!(int2.vol_to_transfer <= params.max_transfer_volume);
        let expected = int1.concentration * int2.vol_to_transfer / int2.fill_volume();
        assert!((int2.concentration - expected).abs() <= expected * 1e-12);
    }

    #[test]
    fn test_dose_series_all_recipes_meet_tolerance() {
        let params = params();
        let targets = [50.0, 10.0, 3.0, 1.0, 0.3, 0.1, 0.03, 0.01, 0.003, 0.001];
        let plan = solve_concentrations(&params, &targets, &[10_000.0], 1);
        assert!(plan.unsatisfied.is_empty(), "{:?}", plan.unsatisfied);
        for target in targets {
            assert_recipe_ok(&params, target, plan.get(target).unwrap(), 1);
        }
    }

    #[test]
    fn test_combination_shares_dmso_allowance() {
        let params = params();
        let plan = solve_concentrations(&params, &[5.0], &[1000.0], 2);
        let obj = plan.get(5.0);
        assert!(obj.is_none() || obj.unwrap().vol_to_transfer <= 62.5);
        let plan = solve_concentrations(&params, &[2.5], &[1000.0], 2);
        assert_recipe_ok(&params, 2.5, plan.get(2.5).unwrap(), 2);
    }
}
