use echo_planner::pre_calculator::{IntermediateDemand, UnsatisfiedTarget};
use echo_planner::{
    about, plan,
    well_block::{format_well_block, get_some_wells},
    EchoPreCalculator, PlanInput, PreCalcResult,
};
use echo_protocol::{CheckpointTracker, TransferStep};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct PrecalcSummary<'a> {
    dead_volumes: &'a BTreeMap<String, f64>,
    destination_plates: usize,
    destination_plates_per_group: usize,
    int1_wells: usize,
    int2_wells: usize,
    total_dmso_backfill_vol: f64,
    intermediate_demand: &'a [IntermediateDemand],
    unsatisfied: &'a [UnsatisfiedTarget],
    checkpoints: &'a CheckpointTracker,
}

#[derive(Serialize)]
struct PlanSummary<'a> {
    plates: Vec<PlateSummary>,
    stages: BTreeMap<&'static str, Vec<TransferStep>>,
    checkpoints: &'a CheckpointTracker,
}

#[derive(Serialize)]
struct PlateSummary {
    barcode: String,
    role: &'static str,
    wells: usize,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  echo_cli --version\n  \
  echo_cli precalc INPUT.json\n  \
  echo_cli plan INPUT.json [--dead-volume BARCODE=NL]...\n  \
  echo_cli format-block WELL...\n  \
  echo_cli expand-block RANGE\n\n  \
  Tip: INPUT.json may also be given as @INPUT.json\n  \
  Set RUST_LOG=info (or debug) for progress output"
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_input_arg(value: &str) -> Result<PlanInput, String> {
    let path = value.strip_prefix('@').unwrap_or(value);
    PlanInput::load_from_path(path).map_err(|e| format!("Could not load '{path}': {e}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Could not serialize JSON output: {e}"))?;
    println!("{text}");
    Ok(())
}

fn parse_dead_volume(value: &str) -> Result<(String, f64), String> {
    let (barcode, volume) = value
        .split_once('=')
        .ok_or_else(|| format!("Expected BARCODE=NL, got '{value}'"))?;
    let volume = volume
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("Invalid dead volume '{volume}': {e}"))?;
    Ok((barcode.trim().to_string(), volume))
}

fn summarize_precalc(pre: &PreCalcResult) -> PrecalcSummary<'_> {
    PrecalcSummary {
        dead_volumes: &pre.dead_volumes,
        destination_plates: pre.destination_plates_count,
        destination_plates_per_group: pre.destination_plates_per_group,
        int1_wells: pre.int1_wells,
        int2_wells: pre.int2_wells,
        total_dmso_backfill_vol: pre.total_dmso_backfill_vol,
        intermediate_demand: &pre.intermediate_demand,
        unsatisfied: &pre.unsatisfied,
        checkpoints: &pre.checkpoints,
    }
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        return Err("Missing command".to_string());
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }

    let command = &args[1];
    match command.as_str() {
        "precalc" => {
            let Some(path) = args.get(2) else {
                usage();
                return Err("Missing INPUT.json for precalc".to_string());
            };
            let input = load_input_arg(path)?;
            let pre = EchoPreCalculator::new(input).run();
            print_json(&summarize_precalc(&pre))
        }
        "plan" => {
            let Some(path) = args.get(2) else {
                usage();
                return Err("Missing INPUT.json for plan".to_string());
            };
            let input = load_input_arg(path)?;
            let mut overrides = vec![];
            let mut rest = args[3..].iter();
            while let Some(arg) = rest.next() {
                match arg.as_str() {
                    "--dead-volume" => {
                        let value = rest
                            .next()
                            .ok_or_else(|| "Missing value for --dead-volume".to_string())?;
                        overrides.push(parse_dead_volume(value)?);
                    }
                    other => {
                        usage();
                        return Err(format!("Unknown argument '{other}'"));
                    }
                }
            }
            let (_, result) = plan(input, &overrides).map_err(|e| e.to_string())?;
            let summary = PlanSummary {
                plates: result
                    .plates
                    .iter()
                    .map(|p| PlateSummary {
                        barcode: p.barcode().to_string(),
                        role: p.role().as_str(),
                        wells: p.size().well_count(),
                    })
                    .collect(),
                stages: result
                    .staged_transfers()
                    .into_iter()
                    .map(|(stage, steps)| (stage.label(), steps))
                    .collect(),
                checkpoints: &result.checkpoints,
            };
            print_json(&summary)
        }
        "format-block" => {
            if args.len() <= 2 {
                usage();
                return Err("Missing well IDs for format-block".to_string());
            }
            let block = format_well_block(&args[2..]).map_err(|e| e.to_string())?;
            println!("{block}");
            Ok(())
        }
        "expand-block" => {
            let Some(range) = args.get(2) else {
                usage();
                return Err("Missing RANGE for expand-block".to_string());
            };
            let wells = get_some_wells(range).map_err(|e| e.to_string())?;
            println!("{}", wells.join(" "));
            Ok(())
        }
        _ => {
            usage();
            Err(format!("Unknown command '{command}'"))
        }
    }
}
