use crate::error::{EchoError, Result};
use crate::well_block::{MAX_PLATE_COLUMNS, MAX_PLATE_ROWS};
use echo_protocol::{Direction, PatternRow, PatternType, MAX_PATTERN_CONCENTRATIONS};
use serde::{Deserialize, Serialize};

/// A named dilution pattern and the well blocks it has been stamped onto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub pattern_type: PatternType,
    pub concentrations: Vec<Option<f64>>,
    pub replicates: usize,
    pub directions: Vec<Direction>,
    pub fold: Option<usize>,
    pub locations: Vec<String>,
}

impl Pattern {
    pub fn new(name: &str, pattern_type: PatternType) -> Self {
        Self {
            name: name.to_string(),
            pattern_type,
            concentrations: vec![],
            replicates: 1,
            directions: vec![Direction::LR],
            fold: None,
            locations: vec![],
        }
    }

    pub fn from_row(row: &PatternRow) -> Result<Self> {
        let name = row.name.trim();
        if name.is_empty() {
            return Err(EchoError::InvalidInput("Pattern without a name".to_string()));
        }
        if row.concentrations.len() > MAX_PATTERN_CONCENTRATIONS {
            return Err(EchoError::InvalidInput(format!(
                "Pattern '{name}' has {} concentrations, at most {MAX_PATTERN_CONCENTRATIONS} are supported",
                row.concentrations.len()
            )));
        }
        if let Some(bad) = row
            .concentrations
            .iter()
            .flatten()
            .find(|c| !c.is_finite() || **c <= 0.0)
        {
            return Err(EchoError::InvalidInput(format!(
                "Pattern '{name}' has a non-positive concentration {bad}"
            )));
        }
        if row.pattern_type.carries_concentrations() && row.replicates == 0 {
            return Err(EchoError::InvalidInput(format!(
                "Pattern '{name}' needs at least one replicate"
            )));
        }
        let directions = if row.directions.is_empty() {
            vec![Direction::LR]
        } else {
            row.directions.clone()
        };
        let fold = match row.pattern_type {
            PatternType::Combination => {
                let fold = row.fold.unwrap_or(directions.len());
                if fold < 2 || fold > directions.len() {
                    return Err(EchoError::InvalidInput(format!(
                        "Combination pattern '{name}' has fold {fold} but {} direction(s); \
                         it needs one direction per axis and at least two axes",
                        directions.len()
                    )));
                }
                Some(fold)
            }
            _ => None,
        };
        let concentrations = if row.pattern_type.carries_concentrations() {
            row.concentrations.clone()
        } else {
            vec![]
        };
        let pattern = Self {
            name: name.to_string(),
            pattern_type: row.pattern_type,
            concentrations,
            replicates: row.replicates.max(1),
            directions,
            fold,
            locations: vec![],
        };
        let max_wells = MAX_PLATE_ROWS * MAX_PLATE_COLUMNS;
        if pattern.block_size() > max_wells {
            return Err(EchoError::InvalidInput(format!(
                "Pattern '{name}' needs blocks of {} wells, more than a {max_wells}-well plate holds",
                pattern.block_size()
            )));
        }
        Ok(pattern)
    }

    /// Concentrations that have been filled in, in slot order.
    pub fn defined_concentrations(&self) -> Vec<f64> {
        self.concentrations.iter().flatten().copied().collect()
    }

    pub fn slot_count(&self) -> usize {
        self.concentrations.len()
    }

    /// Wells one stamped block is expected to hold.
    pub fn block_size(&self) -> usize {
        match self.pattern_type {
            PatternType::Combination => {
                let fold = u32::try_from(self.fold_count()).unwrap_or(u32::MAX);
                self.slot_count()
                    .saturating_pow(fold)
                    .saturating_mul(self.replicates)
            }
            _ => self.slot_count().saturating_mul(self.replicates),
        }
    }

    /// Number of compounds sharing one destination well.
    pub fn fold_count(&self) -> usize {
        match self.pattern_type {
            PatternType::Combination => self.fold.unwrap_or(2).max(1),
            _ => 1,
        }
    }

    pub fn direction_for_axis(&self, axis: usize) -> Direction {
        if self.directions.is_empty() {
            return Direction::LR;
        }
        self.directions[axis % self.directions.len()]
    }

    pub fn add_location(&mut self, block: &str) {
        if !self.locations.iter().any(|l| l == block) {
            self.locations.push(block.to_string());
        }
    }

    pub fn remove_location(&mut self, block: &str) {
        self.locations.retain(|l| l != block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pattern_type: PatternType) -> PatternRow {
        PatternRow {
            name: " Dose ".to_string(),
            pattern_type,
            directions: vec![],
            replicates: 2,
            concentrations: vec![Some(10.0), None, Some(1.0)],
            fold: None,
        }
    }

    #[test]
    fn test_from_row_treatment() {
        let pattern = Pattern::from_row(&row(PatternType::Treatment)).unwrap();
        assert_eq!(pattern.name, "Dose");
        assert_eq!(pattern.directions, vec![Direction::LR]);
        assert_eq!(pattern.defined_concentrations(), vec![10.0, 1.0]);
        assert_eq!(pattern.block_size(), 6);
        assert_eq!(pattern.fold_count(), 1);
    }

    #[test]
    fn test_from_row_combination_and_solvent() {
        let mut combo = row(PatternType::Combination);
        combo.directions = vec![Direction::LR, Direction::TB];
        combo.replicates = 1;
        let pattern = Pattern::from_row(&combo).unwrap();
        assert_eq!(pattern.fold, Some(2));
        assert_eq!(pattern.block_size(), 9);
        assert_eq!(pattern.direction_for_axis(1), Direction::TB);

        let solvent = Pattern::from_row(&row(PatternType::Solvent)).unwrap();
        assert!(solvent.concentrations.is_empty());
    }

    #[test]
    fn test_from_row_rejects_bad_rows() {
        let mut bad = row(PatternType::Treatment);
        bad.concentrations = vec![Some(-1.0)];
        assert!(Pattern::from_row(&bad).is_err());
        let mut bad = row(PatternType::Treatment);
        bad.concentrations = vec![Some(1.0); MAX_PATTERN_CONCENTRATIONS + 1];
        assert!(Pattern::from_row(&bad).is_err());
        let mut bad = row(PatternType::Control);
        bad.replicates = 0;
        assert!(Pattern::from_row(&bad).is_err());
    }

    #[test]
    fn test_from_row_rejects_bad_combination_fold() {
        let mut combo = row(PatternType::Combination);
        combo.directions = vec![Direction::LR, Direction::TB];
        for fold in [0, 1, 3, 15] {
            combo.fold = Some(fold);
            assert!(
                matches!(Pattern::from_row(&combo), Err(EchoError::InvalidInput(_))),
                "fold {fold} should be rejected"
            );
        }
        // A single direction leaves no second axis.
        combo.fold = None;
        combo.directions = vec![Direction::LR];
        assert!(Pattern::from_row(&combo).is_err());
    }

    #[test]
    fn test_from_row_rejects_blocks_larger_than_any_plate() {
        let mut combo = row(PatternType::Combination);
        combo.directions = vec![Direction::LR; 15];
        combo.concentrations = vec![Some(1.0); 20];
        combo.fold = Some(15);
        combo.replicates = 1;
        assert!(matches!(Pattern::from_row(&combo), Err(EchoError::InvalidInput(_))));

        let mut big = row(PatternType::Treatment);
        big.concentrations = vec![Some(1.0); 20];
        big.replicates = 100;
        assert!(Pattern::from_row(&big).is_err());
    }

    #[test]
    fn test_locations_are_idempotent() {
        let mut pattern = Pattern::new("Dose", PatternType::Treatment);
        pattern.add_location("A01:B10");
        pattern.add_location("A01:B10");
        assert_eq!(pattern.locations.len(), 1);
        pattern.remove_location("A01:B10");
        assert!(pattern.locations.is_empty());
    }
}
