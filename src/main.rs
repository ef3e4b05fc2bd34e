use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Result};
use clap::{Args, Parser, Subcommand};

use taiga::matrix::csr::{print_spgemm_stats, CsrMatrix};
use taiga::matrix::data::MatrixData;
use taiga::matrix::mmio::read_matrix_market;
use taiga::matrix::rmat::gen_rmat;
use taiga::sim::top::Simulator;

#[derive(Parser)]
#[command(version, about = "Cycle-level simulator for sparse matrix multiplication accelerators")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a simulation
    Simulate(SimulateArgs),
    /// Print SpGEMM stats
    Stats(StatsArgs),
    /// Generate a random sparse matrix
    Generate(GenerateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// matrix file
    #[arg(short, long, visible_alias = "matrix1")]
    matrix: PathBuf,
    /// matrix file
    #[arg(long)]
    matrix2: Option<PathBuf>,
    /// config file
    #[arg(short, long)]
    config: PathBuf,
    /// output directory
    #[arg(short, long)]
    outdir: Option<PathBuf>,
    /// output filename
    #[arg(long, requires = "outdir")]
    outname: Option<String>,
    /// compute the numeric result and check it
    #[arg(long, overrides_with = "no_compute_result")]
    compute_result: bool,
    #[arg(long, hide = true)]
    no_compute_result: bool,
}

#[derive(Args)]
struct StatsArgs {
    /// matrix file
    #[arg(short, long, visible_alias = "matrix1")]
    matrix: PathBuf,
    /// matrix file
    #[arg(long)]
    matrix2: Option<PathBuf>,
    /// output directory
    #[arg(short, long)]
    outdir: Option<PathBuf>,
    /// output filename
    #[arg(long, requires = "outdir")]
    outname: Option<String>,
}

#[derive(Args)]
struct GenerateArgs {
    /// number of nodes
    #[arg(short = 'n', long = "num-nodes")]
    num_nodes: u32,
    /// number of edges
    #[arg(short = 'e', long = "num-edges")]
    num_edges: u32,
    /// a parameter
    #[arg(short = 'a')]
    a: f64,
    /// b parameter
    #[arg(short = 'b')]
    b: f64,
    /// c parameter
    #[arg(short = 'c')]
    c: f64,
    /// seed
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// output directory
    #[arg(short, long)]
    outdir: PathBuf,
    /// output filename
    #[arg(long)]
    outname: String,
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Load A, and derive B: the second file when given, else A itself for a
/// square matrix, else the transpose.
fn load_matrices(matrix1: &Path, matrix2: Option<&Path>) -> Result<(Arc<CsrMatrix>, Arc<CsrMatrix>)> {
    println!("Loading matrix A: {}...", matrix1.display());
    let a = Arc::new(read_matrix_market(matrix1)?);
    let b = match matrix2 {
        Some(path) => {
            println!("Loading matrix B: {}...", path.display());
            Arc::new(read_matrix_market(path)?)
        }
        None => {
            if a.num_rows == a.num_cols {
                println!("Matrix B = A");
                Arc::clone(&a)
            } else {
                println!("Matrix B = A^T");
                Arc::new(a.transpose())
            }
        }
    };
    Ok((a, b))
}

fn output_path(
    outdir: Option<&Path>,
    outname: Option<&str>,
    default_name: impl FnOnce() -> String,
) -> Result<Option<PathBuf>> {
    let Some(outdir) = outdir else {
        return Ok(None);
    };
    fs::create_dir_all(outdir)?;
    let name = match outname {
        Some(name) => name.to_string(),
        None => default_name(),
    };
    Ok(Some(outdir.join(name)))
}

fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let compute_result = !args.no_compute_result || args.compute_result;
    let out_path = output_path(args.outdir.as_deref(), args.outname.as_deref(), || {
        let mut name = file_stem(&args.matrix);
        if let Some(matrix2) = &args.matrix2 {
            name.push('_');
            name.push_str(&file_stem(matrix2));
        }
        name.push('_');
        name.push_str(&file_stem(&args.config));
        name.push_str("_sim_results.txt");
        name
    })?;

    let (a, b) = load_matrices(&args.matrix, args.matrix2.as_deref())?;
    let mut mat = MatrixData::new(a, b, compute_result)?;
    let mut simulator = Simulator::from_file(&args.config, &mat, out_path.clone())?;
    println!("Starting simulation...");
    simulator.run_simulation(&mut mat)?;
    if let Some(path) = out_path {
        println!("Simulation results written to {}", path.display());
    }
    Ok(())
}

fn run_stats(args: &StatsArgs) -> Result<()> {
    let out_path = output_path(args.outdir.as_deref(), args.outname.as_deref(), || {
        let mut name = file_stem(&args.matrix);
        if let Some(matrix2) = &args.matrix2 {
            name.push('_');
            name.push_str(&file_stem(matrix2));
        }
        name.push_str("_spGEMM_stats.txt");
        name
    })?;

    let (a, b) = load_matrices(&args.matrix, args.matrix2.as_deref())?;
    println!("Computing spGEMM stats...");
    match &out_path {
        Some(path) => {
            let mut file = fs::File::create(path)?;
            print_spgemm_stats(&a, &b, &mut file)?;
            println!("Stats written to {}", path.display());
        }
        None => {
            print_spgemm_stats(&a, &b, &mut std::io::stdout())?;
        }
    }
    Ok(())
}

fn run_generate(args: &GenerateArgs) -> Result<()> {
    ensure!(
        args.a + args.b + args.c < 1.0,
        "invalid parameters: A + B + C must be smaller than 1.0"
    );
    fs::create_dir_all(&args.outdir)?;
    let out_path = args.outdir.join(&args.outname);
    gen_rmat(
        &out_path,
        args.num_nodes,
        args.num_edges,
        args.a,
        args.b,
        args.c,
        args.seed,
    )
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Simulate(args) => run_simulate(args),
        Command::Stats(args) => run_stats(args),
        Command::Generate(args) => run_generate(args),
    };
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
