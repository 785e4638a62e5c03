// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use ensemble::{Cell, CellId, Color, SinkStates, System, Walker, WalkerIdSource};
use master::{EngineConfig, IterationEngine};
use resample::{MultiColor, OneColor, Resampler, SaveWeights};
use topology::Topology;
use transport::TransportConfig;

mod local;

use crate::local::LocalTransport;

static INTERRUPT: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigint(_: libc::c_int) {
    if let Some(flag) = INTERRUPT.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

///
/// The driver: builds the System from a topology and a cell table, picks the
/// resampler stack, wires the transport, and runs the iteration engine.
///
fn main() {
    env_logger::init();
    let matches = parse_args();
    if let Err(e) = run(&matches) {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn parse_args() -> ArgMatches {
    Command::new("awed")
        .about("Accelerated Weighted Ensemble master")
        .arg(
            Arg::new("iterations")
                .short('i')
                .long("iterations")
                .value_parser(clap::value_parser!(u32))
                .default_value("5")
                .help("Number of iterations to run"),
        )
        .arg(
            Arg::new("walkers")
                .short('w')
                .long("walkers-per-cell")
                .value_parser(clap::value_parser!(u32))
                .default_value("4")
                .help("Target number of walkers per cell"),
        )
        .arg(
            Arg::new("restarts")
                .short('r')
                .long("restarts")
                .value_parser(clap::value_parser!(i64))
                .allow_hyphen_values(true)
                .default_value("95")
                .help("Times to restart a failed task; negative for unlimited"),
        )
        .arg(
            Arg::new("maxreps")
                .short('R')
                .long("maxreps")
                .value_parser(clap::value_parser!(i64))
                .allow_hyphen_values(true)
                .default_value("9")
                .help("Times to speculatively replicate a task; negative for unlimited"),
        )
        .arg(
            Arg::new("checkpoint-period")
                .long("checkpoint-period")
                .value_parser(clap::value_parser!(u32))
                .default_value("1")
                .help("Iterations between checkpoints"),
        )
        .arg(
            Arg::new("wait-timeout")
                .long("wait-timeout")
                .value_parser(clap::value_parser!(u64))
                .default_value("10")
                .help("Seconds each transport wait may block"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16))
                .default_value("9123")
                .help("Port for the transport to listen on"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .help("Project name to advertise to a catalog server"),
        )
        .arg(
            Arg::new("fastabort")
                .short('f')
                .long("fastabort")
                .value_parser(clap::value_parser!(f64))
                .allow_hyphen_values(true)
                .default_value("-1.0")
                .help("Straggler fast-abort multiplier; non-positive disables"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Transport debug subsystems to enable"),
        )
        .arg(
            Arg::new("topology")
                .long("topology")
                .required(true)
                .help("Topology PDB shared by all walkers"),
        )
        .arg(
            Arg::new("cells")
                .long("cells")
                .required(true)
                .help("Cell table: one '<id> [core-color]' per line"),
        )
        .arg(
            Arg::new("walkers-dir")
                .long("walkers-dir")
                .help("Directory of State<cell>-<k>.pdb starting structures"),
        )
        .arg(
            Arg::new("executable")
                .long("executable")
                .required(true)
                .help("Worker script executed once per task"),
        )
        .arg(
            Arg::new("cache")
                .long("cache")
                .action(ArgAction::Append)
                .help("Additional file to cache on workers (repeatable)"),
        )
        .arg(
            Arg::new("output-dir")
                .long("output-dir")
                .default_value(".")
                .help("Directory for the resampler's CSV outputs"),
        )
        .get_matches()
}

fn run(matches: &ArgMatches) -> Result<(), String> {
    let iterations = *matches.get_one::<u32>("iterations").unwrap();
    let nwalkers = *matches.get_one::<u32>("walkers").unwrap();
    let output_dir = PathBuf::from(matches.get_one::<String>("output-dir").unwrap());

    let topology = Topology::from_file(Path::new(matches.get_one::<String>("topology").unwrap()))?;
    let cells = parse_cell_table(Path::new(matches.get_one::<String>("cells").unwrap()))?;

    let mut partition = SinkStates::new();
    for &(id, core) in &cells {
        if let Some(core) = core {
            partition.add(core, [CellId(id)]);
        }
    }

    let mut ids = WalkerIdSource::new();
    let system = build_system(
        &topology,
        &cells,
        &partition,
        nwalkers,
        matches.get_one::<String>("walkers-dir").map(PathBuf::from),
        &mut ids,
    )?;
    log::info!(
        "Loaded {} cells and {} walkers ({} colors)",
        system.ncells(),
        system.nwalkers(),
        partition.ncolors()
    );

    let inner = if partition.ncolors() > 0 {
        Resampler::MultiColor(MultiColor::new(nwalkers, partition, &output_dir)?)
    } else {
        Resampler::OneColor(OneColor::new(nwalkers, &output_dir)?)
    };
    let resampler = Resampler::SaveWeights(SaveWeights::new(inner, &output_dir));

    let mut transport_config = TransportConfig::new(*matches.get_one::<u16>("port").unwrap());
    if let Some(name) = matches.get_one::<String>("name") {
        transport_config.name = name.clone();
        transport_config.catalog = true;
    }
    if let Some(debug) = matches.get_one::<String>("debug") {
        transport_config.debug = debug.clone();
    }
    let fastabort = *matches.get_one::<f64>("fastabort").unwrap();
    if fastabort > 0.0 {
        transport_config.fastabort_multiplier = Some(fastabort);
    }
    transport_config.execute(matches.get_one::<String>("executable").unwrap());
    if let Some(cached) = matches.get_many::<String>("cache") {
        for path in cached {
            transport_config.cache_file(path);
        }
    }
    let transport = LocalTransport::new(&transport_config)?;

    let mut engine_config = EngineConfig::new(iterations);
    engine_config.restarts = cap_from(*matches.get_one::<i64>("restarts").unwrap());
    engine_config.maxreps = cap_from(*matches.get_one::<i64>("maxreps").unwrap());
    engine_config.checkpoint_period = *matches.get_one::<u32>("checkpoint-period").unwrap();
    engine_config.wait_timeout =
        Duration::from_secs(*matches.get_one::<u64>("wait-timeout").unwrap());

    let mut engine = IterationEngine::new(
        system,
        resampler,
        Box::new(transport),
        ids,
        engine_config,
    )?;

    let flag = engine.interrupt_flag();
    let _ = INTERRUPT.set(flag);
    let handler = on_sigint as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    engine.run()?;
    log::info!("Run complete after {} iterations", engine.iteration());
    Ok(())
}

fn cap_from(value: i64) -> Option<u32> {
    if value < 0 {
        None
    } else {
        Some(value as u32)
    }
}

///
/// Parse the cell table: one cell per line as `<id>` or `<id> <core-color>`,
/// with `#` comments.
///
fn parse_cell_table(path: &Path) -> Result<Vec<(u32, Option<Color>)>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read cell table {}: {}", path.display(), e))?;
    let mut cells = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let id = fields
            .next()
            .unwrap()
            .parse::<u32>()
            .map_err(|e| format!("Bad cell id on line {}: {}", lineno + 1, e))?;
        let core = match fields.next() {
            Some(core) => Some(
                core.parse::<Color>()
                    .map_err(|e| format!("Bad core color on line {}: {}", lineno + 1, e))?,
            ),
            None => None,
        };
        if fields.next().is_some() {
            return Err(format!("Trailing fields on line {}", lineno + 1));
        }
        cells.push((id, core));
    }
    if cells.is_empty() {
        return Err(format!("Cell table {} is empty", path.display()));
    }
    Ok(cells)
}

///
/// Build the initial population: `nwalkers` walkers per cell with uniform
/// weights, starting from per-cell PDBs when a walkers directory is given
/// and from the topology's own coordinates otherwise.
///
fn build_system(
    topology: &Topology,
    cells: &[(u32, Option<Color>)],
    partition: &SinkStates,
    nwalkers: u32,
    walkers_dir: Option<PathBuf>,
    ids: &mut WalkerIdSource,
) -> Result<System, String> {
    let mut system = System::new(topology.clone());
    for &(id, core) in cells {
        let cell = match core {
            Some(core) => Cell::with_core(CellId(id), core),
            None => Cell::new(CellId(id)),
        };
        system.add_cell(cell)?;
    }

    let weight = 1.0 / f64::from(nwalkers) / cells.len() as f64;
    for &(id, _) in cells {
        let color = partition.color(CellId(id));
        for k in 0..nwalkers {
            let coords = match &walkers_dir {
                Some(dir) => {
                    let pdb = dir.join(format!("State{id}-{k}.pdb"));
                    Topology::from_file(&pdb)?.coords()
                }
                None => topology.coords(),
            };
            let walker = Walker::new(ids.next_id(), coords, CellId(id), color, weight)?;
            system.add_walker(walker)?;
        }
    }
    Ok(system)
}
