use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::info;

use tibbar_core::config::MemoryConfig;
use tibbar_core::suites::{self, SUITE_NAMES};
use tibbar_core::Tibbar;

#[derive(Parser, Debug)]
#[command(name = "tibbar")]
#[command(about = "Tibbar - RISC-V instruction stream generator", long_about = None)]
struct Args {
    /// Named test suite, e.g. simple, ldst, rel_branching
    #[arg(long, short = 'g', value_parser = SUITE_NAMES)]
    generator: String,

    /// Output assembly file
    #[arg(long, short = 'o', default_value = "test.S")]
    output: PathBuf,

    /// Run seed; identical seeds reproduce identical streams
    #[arg(long, short = 's', default_value_t = 42)]
    seed: u64,

    /// Log verbosity
    #[arg(long, short = 'v', default_value = "info", value_parser = ["debug", "info", "warning", "error"])]
    verbosity: String,

    /// Write a debug YAML dump of the run to FILE
    #[arg(long, value_name = "FILE")]
    debug_yaml: Option<PathBuf>,

    /// Memory layout YAML (banks, code/data, base, size); built-in default
    /// when omitted
    #[arg(long, value_name = "FILE")]
    memory_config: Option<PathBuf>,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = match &args.memory_config {
        Some(path) => MemoryConfig::load(path)?,
        None => MemoryConfig::default_config(),
    };

    let mut engine = Tibbar::new(args.seed, config)?;
    let mut generator = suites::build(&args.generator, &mut engine)?;
    engine.create_test(&mut generator)?;

    let emitter = engine.emitter();
    std::fs::write(&args.output, emitter.assembly())
        .with_context(|| format!("writing {}", args.output.display()))?;
    let ld_path = args.output.with_extension("ld");
    std::fs::write(&ld_path, emitter.linker_script())
        .with_context(|| format!("writing {}", ld_path.display()))?;
    if let Some(path) = &args.debug_yaml {
        std::fs::write(path, emitter.debug_yaml()?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("wrote debug YAML to {}", path.display());
    }
    info!("wrote {}", args.output.display());
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbosity.as_str() {
        "debug" => log::LevelFilter::Debug,
        "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tibbar: error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
