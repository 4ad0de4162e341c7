use crate::error::{EchoError, Result};
use crate::plate::PlateSize;
use echo_protocol::{CommonData, NL_PER_UL};
use serde::{Deserialize, Serialize};

pub const DMSO: &str = "DMSO";

/// Aliquots above this volume (nL) sit on plates that need the larger dead volume.
pub const LARGE_ALIQUOT_THRESHOLD: f64 = 15_000.0;
pub const LARGE_PLATE_DEAD_VOLUME: f64 = 15_000.0;
pub const SMALL_PLATE_DEAD_VOLUME: f64 = 2_500.0;

/// Dead volume for a plate whose largest aliquot is `max_aliquot` nL.
pub fn dead_volume_for(max_aliquot: f64) -> f64 {
    if max_aliquot > LARGE_ALIQUOT_THRESHOLD {
        LARGE_PLATE_DEAD_VOLUME
    } else {
        SMALL_PLATE_DEAD_VOLUME
    }
}

/// Assay and instrument settings; every volume is in nL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoParameters {
    pub droplet_size: f64,
    pub max_transfer_volume: f64,
    pub assay_volume: f64,
    pub backfill_volume: f64,
    pub max_dmso_fraction: f64,
    pub allowable_error: f64,
    pub dest_replicates: usize,
    pub create_int_concs: bool,
    pub dmso_normalization: bool,
    pub destination_plate_size: PlateSize,
    pub intermediate_plate_size: PlateSize,
}

impl Default for EchoParameters {
    fn default() -> Self {
        Self::from_common_data(&CommonData::default()).unwrap_or_else(|_| Self {
            droplet_size: 2.5,
            max_transfer_volume: 500.0,
            assay_volume: 25_000.0,
            backfill_volume: 40_000.0,
            max_dmso_fraction: 0.005,
            allowable_error: 0.1,
            dest_replicates: 1,
            create_int_concs: true,
            dmso_normalization: false,
            destination_plate_size: PlateSize::Wells384,
            intermediate_plate_size: PlateSize::Wells384,
        })
    }
}

impl EchoParameters {
    pub fn from_common_data(common: &CommonData) -> Result<Self> {
        let ret = Self {
            droplet_size: common.droplet_size_nl,
            max_transfer_volume: common.max_transfer_volume_nl,
            assay_volume: common.final_assay_volume * NL_PER_UL,
            backfill_volume: common.intermediate_backfill_volume * NL_PER_UL,
            max_dmso_fraction: common.max_dmso_fraction,
            allowable_error: common.allowable_error,
            dest_replicates: common.dest_replicates,
            create_int_concs: common.create_int_concs,
            dmso_normalization: common.dmso_normalization,
            destination_plate_size: PlateSize::from_well_count(common.destination_plate_size)
                .ok_or_else(|| {
                    EchoError::InvalidInput(format!(
                        "Unsupported destination plate size {}",
                        common.destination_plate_size
                    ))
                })?,
            intermediate_plate_size: PlateSize::from_well_count(common.intermediate_plate_size)
                .ok_or_else(|| {
                    EchoError::InvalidInput(format!(
                        "Unsupported intermediate plate size {}",
                        common.intermediate_plate_size
                    ))
                })?,
        };
        ret.validate()?;
        Ok(ret)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("droplet size", self.droplet_size),
            ("max transfer volume", self.max_transfer_volume),
            ("final assay volume", self.assay_volume),
            ("max DMSO fraction", self.max_dmso_fraction),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(EchoError::InvalidInput(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.max_transfer_volume < self.droplet_size {
            return Err(EchoError::InvalidInput(
                "max transfer volume is smaller than one droplet".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.allowable_error) {
            return Err(EchoError::InvalidInput(format!(
                "allowable error must be in [0, 1), got {}",
                self.allowable_error
            )));
        }
        if self.backfill_volume < 0.0 {
            return Err(EchoError::InvalidInput(
                "intermediate backfill volume is negative".to_string(),
            ));
        }
        if self.dest_replicates == 0 {
            return Err(EchoError::InvalidInput(
                "destination replicates must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Largest DMSO volume one destination well tolerates.
    pub fn dmso_ceiling_volume(&self) -> f64 {
        self.assay_volume * self.max_dmso_fraction
    }

    /// Upper bound for a single compound transfer into a destination well,
    /// with the DMSO allowance shared among `fold` compounds.
    pub fn max_destination_transfer(&self, fold: usize) -> f64 {
        let share = self.dmso_ceiling_volume() / fold.max(1) as f64;
        self.max_transfer_volume.min(share)
    }

    /// Dead volume of an intermediate well holding backfill plus one transfer.
    pub fn intermediate_dead_volume(&self) -> f64 {
        dead_volume_for(self.backfill_volume)
    }

    pub fn is_quantized(&self, volume: f64) -> bool {
        let steps = volume / self.droplet_size;
        (steps - steps.round()).abs() < 1e-6
    }

    pub fn round_nearest(&self, volume: f64) -> f64 {
        (volume / self.droplet_size).round() * self.droplet_size
    }

    pub fn round_up(&self, volume: f64) -> f64 {
        (volume / self.droplet_size - 1e-9).ceil() * self.droplet_size
    }

    pub fn round_down(&self, volume: f64) -> f64 {
        (volume / self.droplet_size + 1e-9).floor() * self.droplet_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_common_data_converts_to_nl() {
        let params = EchoParameters::from_common_data(&CommonData::default()).unwrap();
        assert_eq!(params.assay_volume, 25_000.0);
        assert_eq!(params.backfill_volume, 40_000.0);
        assert_eq!(params.dmso_ceiling_volume(), 125.0);
        assert_eq!(params.max_destination_transfer(1), 125.0);
        assert_eq!(params.max_destination_transfer(2), 62.5);
        assert_eq!(params.intermediate_dead_volume(), 15_000.0);
    }

    #[test]
    fn test_rejects_bad_settings() {
        let common = CommonData {
            allowable_error: 1.5,
            ..CommonData::default()
        };
        assert!(EchoParameters::from_common_data(&common).is_err());
        let common = CommonData {
            destination_plate_size: 100,
            ..CommonData::default()
        };
        assert!(EchoParameters::from_common_data(&common).is_err());
    }

    #[test]
    fn test_dead_volume_rule() {
        assert_eq!(dead_volume_for(15_000.0), 2_500.0);
        assert_eq!(dead_volume_for(15_000.1), 15_000.0);
    }

    #[test]
    fn test_droplet_rounding() {
        let params = EchoParameters::default();
        assert_eq!(params.round_nearest(6.0), 5.0);
        assert_eq!(params.round_up(5.1), 7.5);
        assert_eq!(params.round_up(5.0), 5.0);
        assert_eq!(params.round_down(7.4), 5.0);
        assert!(params.is_quantized(12.5));
        assert!(!params.is_quantized(12.6));
    }
}
