use crate::config::dead_volume_for;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One stock aliquot: volume in nL, concentration in µM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundLocation {
    pub barcode: String,
    pub well_id: String,
    pub volume: f64,
    pub concentration: f64,
}

/// compound ID -> pattern name -> stock locations, as supplied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompoundInventory {
    compounds: BTreeMap<String, BTreeMap<String, Vec<CompoundLocation>>>,
}

impl CompoundInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_location(&mut self, compound_id: &str, pattern_name: &str, location: CompoundLocation) {
        self.compounds
            .entry(compound_id.to_string())
            .or_default()
            .entry(pattern_name.to_string())
            .or_default()
            .push(location);
    }

    pub fn compound_ids(&self) -> impl Iterator<Item = &String> {
        self.compounds.keys()
    }

    pub fn patterns_for(&self, compound_id: &str) -> Option<&BTreeMap<String, Vec<CompoundLocation>>> {
        self.compounds.get(compound_id)
    }

    pub fn locations(&self, compound_id: &str, pattern_name: &str) -> &[CompoundLocation] {
        self.compounds
            .get(compound_id)
            .and_then(|p| p.get(pattern_name))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Compounds (sorted) that list `pattern_name` among their patterns.
    pub fn compounds_with_pattern(&self, pattern_name: &str) -> Vec<String> {
        self.compounds
            .iter()
            .filter(|(_, patterns)| patterns.contains_key(pattern_name))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String, &CompoundLocation)> {
        self.compounds.iter().flat_map(|(compound, patterns)| {
            patterns
                .iter()
                .flat_map(move |(pattern, locs)| locs.iter().map(move |loc| (compound, pattern, loc)))
        })
    }

    /// Every physical location once, even when it is listed under several patterns.
    pub fn unique_locations(&self) -> Vec<(String, CompoundLocation)> {
        let mut seen: BTreeMap<(String, String), (String, CompoundLocation)> = BTreeMap::new();
        for (compound, _, loc) in self.iter() {
            seen.entry((loc.barcode.clone(), loc.well_id.clone()))
                .or_insert_with(|| (compound.clone(), loc.clone()));
        }
        seen.into_values().collect()
    }

    pub fn barcodes(&self) -> Vec<String> {
        let mut ret = self
            .iter()
            .map(|(_, _, loc)| loc.barcode.clone())
            .collect::<Vec<_>>();
        ret.sort();
        ret.dedup();
        ret
    }

    /// Distinct stock concentrations of a compound, highest first.
    pub fn source_concentrations(&self, compound_id: &str) -> Vec<f64> {
        let mut concs = self
            .compounds
            .get(compound_id)
            .into_iter()
            .flat_map(|p| p.values().flatten())
            .map(|loc| loc.concentration)
            .filter(|c| *c > 0.0)
            .collect::<Vec<_>>();
        concs.sort_by(|a, b| b.total_cmp(a));
        concs.dedup_by(|a, b| (*a - *b).abs() <= 1e-9 * a.abs().max(b.abs()));
        concs
    }

    /// Per-barcode dead volume: 15 µL if any aliquot on the plate exceeds 15 µL.
    pub fn derive_dead_volumes(&self) -> BTreeMap<String, f64> {
        let mut max_aliquot: BTreeMap<String, f64> = BTreeMap::new();
        for (_, loc) in self.unique_locations() {
            let entry = max_aliquot.entry(loc.barcode.clone()).or_insert(0.0);
            *entry = entry.max(loc.volume);
        }
        max_aliquot
            .into_iter()
            .map(|(barcode, max)| (barcode, dead_volume_for(max)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.compounds.is_empty()
    }
}
