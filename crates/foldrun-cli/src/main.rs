//! foldrun - structure reconstruction from distance restraints
//!
//! ## Commands
//!
//! - `reconstruct`: build models from a sequence and restraint set
//! - `minimize`: minimize a PDB structure
//! - `energy`: potential energy of a PDB structure

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};

use foldrun_batch::GridEngine;
use foldrun_core::{
    init_tracing, FoldrunConfig, LogProgress, ReconstructRequest, ReconstructionResult,
    Reconstructor, Refinement, RestraintSpec,
};

#[derive(Parser)]
#[command(name = "foldrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Protein structure reconstruction from distance restraints", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON results
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "FOLDRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Engine binary directory (overrides the config file)
    #[arg(long, global = true, env = "FOLDRUN_BIN_DIR")]
    bin_dir: Option<PathBuf>,

    /// Force-field parameter file (overrides the config file)
    #[arg(long, global = true)]
    forcefield: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct models from a restraint set (JSON)
    Reconstruct {
        /// Restraint set: sequence, distance and torsion restraints
        restraints: PathBuf,

        /// Output directory (must exist)
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Base name of the generated files
        #[arg(short, long, default_value = "model")]
        base: String,

        /// Number of models
        #[arg(short = 'n', long, default_value = "10")]
        models: usize,

        /// Run one job per model on the batch scheduler
        #[arg(long)]
        parallel: bool,

        /// Delete intermediate files
        #[arg(long)]
        cleanup: bool,

        /// Minimize instead of annealing after embedding
        #[arg(long)]
        fast: bool,

        /// Seed for the per-job random seeds
        #[arg(long)]
        seed: Option<u64>,

        /// Directory holding qsub/qstat/qacct/qdel
        #[arg(long)]
        scheduler_bin_dir: Option<PathBuf>,
    },

    /// Minimize a structure; writes <name>.min.pdb next to it
    Minimize {
        pdb: PathBuf,

        /// RMS gradient per atom at which to stop
        #[arg(long, default_value = "0.01")]
        rms: f64,
    },

    /// Potential energy of a structure
    Energy { pdb: PathBuf },
}

#[derive(Serialize)]
struct ModelSummary {
    model: usize,
    pdb: PathBuf,
    bound_violations: u32,
    final_error: f64,
}

#[derive(Serialize)]
struct ReconstructSummary {
    out_dir: PathBuf,
    base_name: String,
    best_model: usize,
    best_pdb: PathBuf,
    models: Vec<ModelSummary>,
}

impl ReconstructSummary {
    fn from_result(result: &ReconstructionResult) -> Self {
        let models = result
            .statistics()
            .iter()
            .zip(result.model_files())
            .map(|(stats, pdb)| ModelSummary {
                model: stats.model,
                pdb,
                bound_violations: stats.bound_violations(),
                final_error: stats.final_error,
            })
            .collect();
        Self {
            out_dir: result.out_dir().to_path_buf(),
            base_name: result.base_name().to_string(),
            best_model: result.best_model(),
            best_pdb: result.best_pdb_file(),
            models,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = match &cli.config {
        Some(path) => FoldrunConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => FoldrunConfig::default(),
    };
    if let Some(bin_dir) = &cli.bin_dir {
        config.engine.bin_dir = bin_dir.clone();
    }
    if let Some(forcefield) = &cli.forcefield {
        config.engine.forcefield = forcefield.clone();
    }

    match cli.command {
        Commands::Reconstruct {
            restraints,
            out_dir,
            base,
            models,
            parallel,
            cleanup,
            fast,
            seed,
            scheduler_bin_dir,
        } => {
            if fast {
                config.engine.refinement = Refinement::Minimization;
            }
            if seed.is_some() {
                config.cluster.seed = seed;
            }
            if let Some(dir) = scheduler_bin_dir {
                config.grid_engine = GridEngine::from_bin_dir(dir);
            }
            let request = ReconstructRequest::new(out_dir, base, models)
                .parallel(parallel)
                .cleanup(cleanup)
                .progress(Arc::new(LogProgress));
            cmd_reconstruct(config, &restraints, &request, cli.json).await
        }
        Commands::Minimize { pdb, rms } => cmd_minimize(config, &pdb, rms, cli.json).await,
        Commands::Energy { pdb } => cmd_energy(config, &pdb, cli.json).await,
    }
}

fn reconstructor(config: &FoldrunConfig) -> Result<Reconstructor> {
    Reconstructor::new(config.engine.clone(), config.cluster.clone())
        .context("Engine installation is not usable")
}

async fn cmd_reconstruct(
    config: FoldrunConfig,
    restraints_path: &Path,
    request: &ReconstructRequest,
    json: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(restraints_path)
        .with_context(|| format!("Failed to read restraints {:?}", restraints_path))?;
    let restraints =
        RestraintSpec::from_json(&text).context("Failed to parse restraints as JSON")?;

    let mut recon = reconstructor(&config)?;
    if request.parallel {
        recon = recon.with_batch_system(Arc::new(config.grid_engine.clone()));

        // Ctrl-C terminates the remote jobs before exiting
        let handle = recon.interrupt_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, terminating cluster jobs");
                handle.interrupt();
            }
        });
    }

    let result = recon
        .reconstruct(&restraints, request)
        .await
        .context("Reconstruction failed")?;
    let summary = ReconstructSummary::from_result(result);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("{:>6}  {:>10}  {:>12}  pdb", "model", "violations", "final error");
    for model in &summary.models {
        println!(
            "{:>6}  {:>10}  {:>12.4}  {}",
            model.model,
            model.bound_violations,
            model.final_error,
            model.pdb.display()
        );
    }
    println!();
    println!(
        "Best model: {} ({})",
        summary.best_model,
        summary.best_pdb.display()
    );
    Ok(())
}

async fn cmd_minimize(config: FoldrunConfig, pdb: &Path, rms: f64, json: bool) -> Result<()> {
    let recon = reconstructor(&config)?;
    let energy = recon
        .minimize(pdb, rms)
        .await
        .with_context(|| format!("Failed to minimize {:?}", pdb))?;
    info!(pdb = %pdb.display(), energy, "Minimized");

    if json {
        println!("{}", serde_json::json!({ "pdb": pdb, "energy": energy }));
    } else {
        println!("Final energy: {:.4}", energy);
    }
    Ok(())
}

async fn cmd_energy(config: FoldrunConfig, pdb: &Path, json: bool) -> Result<()> {
    let recon = reconstructor(&config)?;
    let energy = recon
        .compute_energy(pdb)
        .await
        .with_context(|| format!("Failed to evaluate {:?}", pdb))?;

    if json {
        println!("{}", serde_json::json!({ "pdb": pdb, "energy": energy }));
    } else {
        println!("Potential energy: {:.4}", energy);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_reconstruct() {
        let cli = Cli::try_parse_from([
            "foldrun",
            "reconstruct",
            "r.json",
            "-n",
            "5",
            "--parallel",
            "--fast",
            "--seed",
            "42",
        ])
        .unwrap();
        match cli.command {
            Commands::Reconstruct {
                models,
                parallel,
                fast,
                seed,
                cleanup,
                base,
                ..
            } => {
                assert_eq!(models, 5);
                assert!(parallel);
                assert!(fast);
                assert!(!cleanup);
                assert_eq!(seed, Some(42));
                assert_eq!(base, "model");
            }
            _ => panic!("expected reconstruct"),
        }
    }

    #[test]
    fn test_parse_minimize_default_rms() {
        let cli = Cli::try_parse_from(["foldrun", "minimize", "x.pdb"]).unwrap();
        match cli.command {
            Commands::Minimize { pdb, rms } => {
                assert_eq!(pdb, PathBuf::from("x.pdb"));
                assert_eq!(rms, 0.01);
            }
            _ => panic!("expected minimize"),
        }
    }

    #[test]
    fn test_summary_serializes() {
        let summary = ReconstructSummary {
            out_dir: PathBuf::from("/w"),
            base_name: "m".to_string(),
            best_model: 1,
            best_pdb: PathBuf::from("/w/m.001.pdb"),
            models: vec![ModelSummary {
                model: 1,
                pdb: PathBuf::from("/w/m.001.pdb"),
                bound_violations: 0,
                final_error: 0.5,
            }],
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["best_model"], 1);
        assert_eq!(value["models"][0]["pdb"], "/w/m.001.pdb");
    }
}
