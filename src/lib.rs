pub mod about;
pub mod calculator;
pub mod config;
pub mod error;
pub mod input;
pub mod inventory;
pub mod pattern;
pub mod plate;
pub mod pre_calculator;
pub mod solver;
pub mod well;
pub mod well_block;

pub use calculator::{EchoCalculator, EchoResult};
pub use error::{EchoError, Result};
pub use input::PlanInput;
pub use pre_calculator::{EchoPreCalculator, PreCalcResult};

/// Pre-calculation followed by allocation. Dead-volume overrides are
/// applied before the final pre-calculation pass.
pub fn plan(input: PlanInput, dead_volume_overrides: &[(String, f64)]) -> Result<(PreCalcResult, EchoResult)> {
    let mut pre_calculator = EchoPreCalculator::new(input);
    let mut pre = pre_calculator.run();
    for (barcode, volume) in dead_volume_overrides {
        pre = pre_calculator.update_dead_volume(barcode, *volume)?;
    }
    let result = EchoCalculator::new(pre_calculator.input(), &pre)?.run()?;
    Ok((pre, result))
}
