use crate::error::{EchoError, Result};
use serde::{Deserialize, Serialize};

const VOLUME_EPSILON: f64 = 1e-9;

/// A compound (or a pattern designation when `compound_id` is `None`) at a
/// concentration in µM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub compound_id: Option<String>,
    pub concentration: f64,
    pub pattern_name: Option<String>,
}

impl Content {
    pub fn new(compound_id: Option<&str>, concentration: f64, pattern_name: Option<&str>) -> Self {
        Self {
            compound_id: compound_id.map(|s| s.to_string()),
            concentration,
            pattern_name: pattern_name.map(|s| s.to_string()),
        }
    }

    fn same_slot(&self, other: &Content) -> bool {
        self.compound_id == other.compound_id && self.pattern_name == other.pattern_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solvent {
    pub name: String,
    pub volume: f64,
}

impl Solvent {
    pub fn new(name: &str, volume: f64) -> Self {
        Self {
            name: name.to_string(),
            volume,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Well {
    id: String,
    row: usize,
    col: usize,
    contents: Vec<Content>,
    solvents: Vec<Solvent>,
    total_volume: f64,
    is_unused: bool,
    pub raw_response: Option<f64>,
    pub normalized_response: Option<f64>,
}

impl Well {
    pub fn new(id: &str, row: usize, col: usize) -> Self {
        Self {
            id: id.to_string(),
            row,
            col,
            contents: vec![],
            solvents: vec![],
            total_volume: 0.0,
            is_unused: false,
            raw_response: None,
            normalized_response: None,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline(always)]
    pub fn coords(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    #[inline(always)]
    pub fn contents(&self) -> &[Content] {
        &self.contents
    }

    #[inline(always)]
    pub fn solvents(&self) -> &[Solvent] {
        &self.solvents
    }

    #[inline(always)]
    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    #[inline(always)]
    pub fn is_unused(&self) -> bool {
        self.is_unused
    }

    pub fn content_for(&self, compound_id: &str) -> Option<&Content> {
        self.contents
            .iter()
            .find(|c| c.compound_id.as_deref() == Some(compound_id))
    }

    /// Wells that hold nothing but solvent count as solvent reservoirs.
    pub fn is_solvent_only(&self, solvent: &str) -> bool {
        !self.is_unused
            && self.total_volume > VOLUME_EPSILON
            && self.contents.iter().all(|c| c.compound_id.is_none())
            && self.solvents.iter().all(|s| s.name == solvent)
    }

    /// Concentration of the most concentrated compound in the well.
    pub fn max_compound_concentration(&self) -> Option<f64> {
        self.contents
            .iter()
            .filter(|c| c.compound_id.is_some())
            .map(|c| c.concentration)
            .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))))
    }

    /// Concentration of `compound_id` once the well is made up to `assay_volume`.
    pub fn assay_concentration(&self, compound_id: &str, assay_volume: f64) -> Option<f64> {
        if assay_volume <= 0.0 {
            return None;
        }
        self.content_for(compound_id)
            .map(|c| c.concentration * self.total_volume / assay_volume)
    }

    fn dilute_to(&mut self, new_total: f64) {
        if new_total <= VOLUME_EPSILON {
            return;
        }
        let factor = self.total_volume / new_total;
        for content in &mut self.contents {
            if content.compound_id.is_some() {
                content.concentration *= factor;
            }
        }
    }

    fn merge_solvent(&mut self, name: &str, volume: f64) {
        match self.solvents.iter_mut().find(|s| s.name == name) {
            Some(existing) => existing.volume += volume,
            None => self.solvents.push(Solvent::new(name, volume)),
        }
    }

    fn merge_content(&mut self, content: Content) {
        match self.contents.iter_mut().find(|c| c.same_slot(&content)) {
            Some(existing) => existing.concentration += content.concentration,
            None => self.contents.push(content),
        }
    }

    /// Mixes in `volume` nL of `solvent` carrying `content` at its stated
    /// concentration. Compound mass is conserved across the dilution.
    pub fn add_content(&mut self, content: Content, volume: f64, solvent: &str) {
        self.mix_in(std::slice::from_ref(&content), volume, solvent);
    }

    /// Mixes in `volume` nL of a liquid holding every entry of `contents`.
    pub fn mix_in(&mut self, contents: &[Content], volume: f64, solvent: &str) {
        if volume <= 0.0 {
            return;
        }
        let new_total = self.total_volume + volume;
        self.dilute_to(new_total);
        for content in contents {
            let mut incoming = content.clone();
            if incoming.compound_id.is_some() {
                incoming.concentration *= volume / new_total;
            }
            self.merge_content(incoming);
        }
        self.merge_solvent(solvent, volume);
        self.total_volume = new_total;
    }

    pub fn add_solvent(&mut self, solvent: Solvent) {
        self.mix_in(&[], solvent.volume, &solvent.name);
    }

    /// Removes liquid; concentrations stay, solvent volumes shrink in proportion.
    pub fn remove_volume(&mut self, volume: f64) -> Result<()> {
        if volume < 0.0 || volume > self.total_volume + VOLUME_EPSILON {
            return Err(EchoError::InsufficientVolume {
                well_id: self.id.clone(),
                requested: volume,
                available: self.total_volume,
            });
        }
        let remaining = (self.total_volume - volume).max(0.0);
        if self.total_volume > VOLUME_EPSILON {
            let factor = remaining / self.total_volume;
            for solvent in &mut self.solvents {
                solvent.volume *= factor;
            }
        }
        self.total_volume = remaining;
        Ok(())
    }

    /// Sets a pattern designation without moving any liquid.
    pub fn stamp_content(&mut self, content: Content) {
        match self.contents.iter_mut().find(|c| c.same_slot(&content)) {
            Some(existing) => existing.concentration = content.concentration,
            None => self.contents.push(content),
        }
    }

    pub fn remove_pattern_contents(&mut self, pattern_name: &str) {
        self.contents
            .retain(|c| c.pattern_name.as_deref() != Some(pattern_name));
    }

    pub fn mark_unused(&mut self) {
        self.is_unused = true;
        self.contents.clear();
    }

    pub fn mark_used(&mut self) {
        self.is_unused = false;
    }
}
