use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use marabou::engine::{Engine, ExitCode};
use marabou::parse::{load_query, load_vnnlib_property};
use marabou::{
    BoundTighteningMode, EngineConfig, IncrementalLinearization, Query, SoiInitializationStrategy,
    SoiSearchStrategy, SymbolicTighteningMode,
};

#[derive(Parser)]
#[command(
    name = "marabou",
    version,
    about = "A decision procedure for neural-network verification queries"
)]
struct Cli {
    /// Query in the text format produced by save_query
    #[arg(long, value_name = "FILE")]
    input_query: Option<PathBuf>,

    /// ONNX network (requires --property)
    #[arg(long, value_name = "FILE")]
    network: Option<PathBuf>,

    /// VNN-LIB property constraining the network's inputs and outputs
    #[arg(long, value_name = "FILE")]
    property: Option<PathBuf>,

    /// Worker threads for batched simulation (0 = automatic)
    #[arg(long, default_value_t = 0)]
    num_workers: usize,

    /// Wall-clock budget in seconds (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// 0 = errors only, 1 = progress, 2 = debug
    #[arg(long, default_value_t = 0)]
    verbosity: u8,

    /// PRNG seed
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = SoiInitArg::InputAssignment)]
    soi_init: SoiInitArg,

    #[arg(long, value_enum, default_value_t = SoiSearchArg::Walksat)]
    soi_search: SoiSearchArg,

    /// Symbolic bound tightening
    #[arg(long, value_enum, default_value_t = SbtArg::Sbt)]
    sbt: SbtArg,

    #[arg(long, value_enum, default_value_t = MilpArg::None)]
    milp_tightening: MilpArg,

    /// Write a machine-readable JSON summary here
    #[arg(long, value_name = "FILE")]
    summary: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SoiInitArg {
    InputAssignment,
    CurrentAssignment,
}

#[derive(Clone, Copy, ValueEnum)]
enum SoiSearchArg {
    Mcmc,
    Walksat,
}

#[derive(Clone, Copy, ValueEnum)]
enum SbtArg {
    None,
    Sbt,
}

#[derive(Clone, Copy, ValueEnum)]
enum MilpArg {
    None,
    Lp,
    Milp,
    LpInc,
    MilpInc,
    BackwardConverge,
}

#[derive(Serialize)]
struct Summary {
    verdict: String,
    time_seconds: f64,
    inputs: Vec<f64>,
    outputs: Vec<f64>,
}

fn build_config(cli: &Cli) -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if cli.timeout > 0 {
        config.timeout = Some(Duration::from_secs(cli.timeout));
    }
    config.verbosity = cli.verbosity;
    config.num_workers = cli.num_workers;
    config.soi_initialization = match cli.soi_init {
        SoiInitArg::InputAssignment => SoiInitializationStrategy::InputAssignment,
        SoiInitArg::CurrentAssignment => SoiInitializationStrategy::CurrentAssignment,
    };
    config.soi_search = match cli.soi_search {
        SoiSearchArg::Mcmc => SoiSearchStrategy::Mcmc,
        SoiSearchArg::Walksat => SoiSearchStrategy::Walksat,
    };
    config.symbolic_tightening = match cli.sbt {
        SbtArg::None => SymbolicTighteningMode::None,
        SbtArg::Sbt => SymbolicTighteningMode::Sbt,
    };
    config.bound_tightening = match cli.milp_tightening {
        MilpArg::None => BoundTighteningMode::None,
        MilpArg::Lp => BoundTighteningMode::Lp,
        MilpArg::Milp => BoundTighteningMode::Milp,
        MilpArg::LpInc => BoundTighteningMode::LpIncremental,
        MilpArg::MilpInc => BoundTighteningMode::MilpIncremental,
        MilpArg::BackwardConverge => BoundTighteningMode::BackwardConverge,
    };
    // Backward-converge runs on top of the DeepPoly abstraction.
    if config.bound_tightening == BoundTighteningMode::BackwardConverge {
        config.symbolic_tightening = SymbolicTighteningMode::DeepPoly;
    }
    config
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "error",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn load(cli: &Cli) -> Result<Query, i32> {
    if cli.network.is_some() {
        eprintln!(
            "error: direct ONNX loading is not built in; convert the network \
             to the query format and pass it with --input-query"
        );
        return Err(1);
    }
    let Some(path) = &cli.input_query else {
        eprintln!("error: one of --input-query or --network is required");
        return Err(1);
    };
    let mut query = match load_query(path) {
        Ok(query) => query,
        Err(e) => {
            eprintln!("error: {e}");
            return Err(e.exit_code());
        }
    };
    if let Some(property) = &cli.property {
        if let Err(e) = load_vnnlib_property(property, &mut query) {
            eprintln!("error: {e}");
            return Err(e.exit_code());
        }
    }
    Ok(query)
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    if cli.num_workers > 0 {
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(cli.num_workers)
            .build_global();
    }

    let query = match load(&cli) {
        Ok(query) => query,
        Err(code) => process::exit(code),
    };
    let config = build_config(&cli);
    let started = Instant::now();

    let mut engine = match Engine::process_input_query(query.clone(), config.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(e.exit_code());
        }
    };
    let mut code = engine.solve();

    // Transcendental constraints leave the base engine at UNKNOWN; hand
    // the abstraction to the refinement loop.
    if code == ExitCode::Unknown && !query.nonlinear_constraints().is_empty() {
        let mut refined_query = query.clone();
        engine.extract_solution_into(&mut refined_query);
        let mut cegar = IncrementalLinearization::new(refined_query, engine, config);
        code = cegar.solve();
        if let Some(final_engine) = cegar.release_engine() {
            engine = final_engine;
        } else {
            process::exit(ExitCode::Error.process_exit_code());
        }
    }

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    match code {
        ExitCode::Sat => {
            println!("sat");
            for (index, variable) in query.input_variables().iter().enumerate() {
                let value = engine.solution_value(*variable);
                inputs.push(value);
                println!("x{index} = {value}");
            }
            for (index, variable) in query.output_variables().iter().enumerate() {
                let value = engine.solution_value(*variable);
                outputs.push(value);
                println!("y{index} = {value}");
            }
        }
        ExitCode::Unsat => println!("unsat"),
        ExitCode::Timeout => println!("unknown (timeout)"),
        ExitCode::QuitRequested => println!("unknown (quit requested)"),
        ExitCode::Unknown => println!("unknown"),
        ExitCode::Error => println!("unknown (internal error)"),
    }

    if let Some(path) = &cli.summary {
        let summary = Summary {
            verdict: format!("{code:?}").to_lowercase(),
            time_seconds: started.elapsed().as_secs_f64(),
            inputs,
            outputs,
        };
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    eprintln!("warning: cannot write summary: {e}");
                }
            }
            Err(e) => eprintln!("warning: cannot serialize summary: {e}"),
        }
    }

    process::exit(code.process_exit_code());
}
