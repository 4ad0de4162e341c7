use echo_planner::calculator::CHECKPOINT_ALLOCATION;
use echo_planner::plate::PlateRole;
use echo_planner::pre_calculator::CHECKPOINT_SOURCE_VOLUMES;
use echo_planner::{EchoPreCalculator, PlanInput, plan};
use echo_protocol::{CheckpointStatus, TransferStage};
use std::io::Write;

const INPUT: &str = r#"{
    "common": {
        "max_dmso_fraction": 0.005,
        "intermediate_backfill_volume": 40.0,
        "final_assay_volume": 25.0,
        "allowable_error": 0.1,
        "dest_replicates": 1,
        "create_int_concs": true,
        "dmso_normalization": false
    },
    "patterns": [
        {"name": "Dose", "type": "Treatment", "directions": ["LR"], "replicates": 2,
         "concentrations": [10.0, 1.0, 0.1, 0.01, 0.001, 0.000001]},
        {"name": "DMSO", "type": "Solvent"}
    ],
    "layout": [{"pattern": "Dose", "well_block": "A01:B06"}],
    "compounds": [
        {"barcode": "SRC1", "well": "A01", "compound_id": "CPD-1",
         "concentration": 10000.0, "volume": 15.1, "patterns": "Dose"},
        {"barcode": "SRC1", "well": "H01:H12", "compound_id": "DMSO",
         "volume": 50.0, "patterns": "DMSO"}
    ],
    "barcodes": [{"destination": "ASSAY-001"}]
}"#;

fn input_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(INPUT.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn load() -> PlanInput {
    let file = input_file();
    PlanInput::load_from_path(file.path().to_str().unwrap()).unwrap()
}

#[test]
fn test_two_level_dilution_plan() {
    let (pre, result) = plan(load(), &[("SRC1".to_string(), 2_500.0)]).unwrap();
    assert!(pre.unsatisfied.is_empty());
    assert_eq!(pre.int1_wells, 2);
    assert_eq!(pre.int2_wells, 1);

    assert_eq!(result.plates_with_role(PlateRole::Source).count(), 1);
    assert_eq!(result.plates_with_role(PlateRole::Intermediate1).count(), 1);
    assert_eq!(result.plates_with_role(PlateRole::Intermediate2).count(), 1);
    let dest = result.plate("ASSAY-001").unwrap();
    assert_eq!(dest.role(), PlateRole::Destination);

    let staged = result.staged_transfers();
    let count = |stage| staged.get(&stage).map(|s| s.len()).unwrap_or(0);
    assert_eq!(count(TransferStage::SourceToInt1), 2);
    assert_eq!(count(TransferStage::Int1ToInt2), 1);
    assert_eq!(count(TransferStage::SourceToDest), 4);
    assert_eq!(count(TransferStage::Int1ToDest), 6);
    assert_eq!(count(TransferStage::Int2ToDest), 2);
    assert_eq!(result.transfers.len(), 15);

    let targets = [10.0, 1.0, 0.1, 0.01, 0.001, 0.000001];
    for (col, target) in targets.iter().enumerate() {
        for row in ["A", "B"] {
            let well_id = format!("{row}{:02}", col + 1);
            let actual = dest
                .get_well(&well_id)
                .unwrap()
                .assay_concentration("CPD-1", 25_000.0)
                .unwrap();
            assert!(
                (actual - target).abs() <= target * 0.1 + 1e-15,
                "{well_id}: wanted {target}, got {actual}"
            );
        }
    }
}

#[test]
fn test_dead_volume_override_changes_sufficiency() {
    let mut pre_calculator = EchoPreCalculator::new(load());
    let pre = pre_calculator.run();
    // 15.1 µL stock over a 15 µL reserve cannot feed the plan.
    assert_eq!(pre.dead_volumes["SRC1"], 15_000.0);
    assert_eq!(
        pre.checkpoints.status(CHECKPOINT_SOURCE_VOLUMES),
        Some(CheckpointStatus::Warning)
    );

    let (pre, result) = plan(load(), &[("SRC1".to_string(), 2_500.0)]).unwrap();
    assert_eq!(pre.dead_volumes["SRC1"], 2_500.0);
    assert_eq!(
        pre.checkpoints.status(CHECKPOINT_SOURCE_VOLUMES),
        Some(CheckpointStatus::Passed)
    );
    assert_eq!(
        result.checkpoints.status(CHECKPOINT_ALLOCATION),
        Some(CheckpointStatus::Passed)
    );
    let source = result.plate("SRC1").unwrap();
    assert!(source.get_well("A01").unwrap().total_volume() >= 2_500.0);
}

#[test]
fn test_unknown_dead_volume_barcode_is_an_error() {
    assert!(plan(load(), &[("NOPE".to_string(), 1.0)]).is_err());
}
