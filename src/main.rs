// ========================================================================================
//
//                        THE STRATEGIC ORCHESTRATOR: ASTROLABE
//
// ========================================================================================
//
// This binary is the conductor of the harmonization and ancestry-projection
// pipeline. It owns argument parsing, the environment snapshot, the run
// workspace, and the wiring between the library components; everything
// scientific happens in the library modules and in the external tools behind
// their adapters.
//
// The external workflow engine calls one subcommand per stage:
//
//   build-panel   offline, once per genome build: canonicalize a raw
//                 reference fileset into the versioned panel directory,
//                 optionally translating it into a second build.
//   project       per run: canonicalize the target dataset, intersect it
//                 with the panel, run the projection tool, write the
//                 PCA+ancestry table.
//   merge         per run, after all branches: full outer join of the
//                 call-rate/sex, pedigree and PCA/ancestry tables into the
//                 final per-sample metadata table.
//
// Fatal errors abort with a non-zero exit and no partial output at the
// documented paths; retry and resume belong to the workflow engine.

use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use log::info;

use astrolabe::dataset::{GenomeBuild, GenotypeDataset};
use astrolabe::intersect::intersect;
use astrolabe::merge::{merge_tables, write_merged};
use astrolabe::panel::{PanelBuildRequest, ReferencePanel, build_panel};
use astrolabe::project::{output_path, run_projection};
use astrolabe::resources::{EnvironmentSnapshot, negotiate};
use astrolabe::tools::{SystemRunner, ToolConfig, Workspace};
use astrolabe::variant::canonicalize;

#[derive(Parser)]
#[clap(
    name = "astrolabe",
    version,
    about = "Genome-build harmonization and reference-projected ancestry engine."
)]
struct Cli {
    /// Optional TOML file overriding external tool names.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Override the negotiated thread count for external tools.
    #[clap(long, global = true)]
    threads: Option<usize>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the per-build reference panel from a raw reference fileset.
    BuildPanel(BuildPanelArgs),
    /// Harmonize a target dataset against the panel and project ancestry.
    Project(ProjectArgs),
    /// Merge per-sample result tables into the final metadata table.
    Merge(MergeArgs),
}

#[derive(Args)]
struct BuildPanelArgs {
    /// Prefix of the raw reference fileset triple.
    raw_prefix: PathBuf,

    /// Root directory the versioned panels are written under.
    panel_dir: PathBuf,

    /// Genome build the raw fileset is expressed in.
    #[clap(default_value = "hg19")]
    build: String,

    /// Ancestry ground-truth labels (SampleID<TAB>label).
    #[clap(long)]
    labels: PathBuf,

    /// Additionally produce a panel translated into this build.
    #[clap(long, requires = "chain")]
    lift_to: Option<String>,

    /// Chain file for the coordinate translation.
    #[clap(long, requires = "lift_to")]
    chain: Option<PathBuf>,
}

#[derive(Args)]
struct ProjectArgs {
    /// Prefix of the target genotype fileset triple.
    dataset_prefix: PathBuf,

    /// Root directory of the versioned reference panels.
    panel_dir: PathBuf,

    /// Output prefix; the PCA+ancestry table is written to
    /// `<out_prefix>.pca.tsv`.
    out_prefix: PathBuf,

    /// Genome build of the target dataset.
    #[clap(default_value = "hg38")]
    build: String,

    /// Keep intermediate filesets in this directory instead of an
    /// auto-removed temporary one. Must not be shared between runs.
    #[clap(long)]
    workdir: Option<PathBuf>,
}

#[derive(Args)]
struct MergeArgs {
    /// Path of the merged per-sample metadata table.
    out_path: PathBuf,

    /// Input tables, each tab-separated with a SampleID column.
    #[clap(short, long = "input", num_args = 1.., required = true)]
    inputs: Vec<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Fatal error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = ToolConfig::load(cli.config.as_deref())?;
    let snapshot = EnvironmentSnapshot::capture();
    let budget = negotiate(&snapshot, cli.threads);
    let runner = SystemRunner;

    match cli.command {
        Command::BuildPanel(args) => {
            let source_build: GenomeBuild = args.build.parse()?;
            let lift_to = match (&args.lift_to, &args.chain) {
                (Some(build), Some(chain)) => {
                    Some((build.parse::<GenomeBuild>()?, chain.as_path()))
                }
                _ => None,
            };
            let workspace = Workspace::ephemeral()?;
            let request = PanelBuildRequest {
                raw_prefix: &args.raw_prefix,
                source_build,
                panel_dir: &args.panel_dir,
                labels: &args.labels,
                lift_to,
            };
            build_panel(&request, &config, &runner, &budget, &workspace)?;
        }

        Command::Project(args) => {
            let build: GenomeBuild = args.build.parse()?;
            let workspace = match &args.workdir {
                Some(dir) => Workspace::at(dir)?,
                None => Workspace::ephemeral()?,
            };

            // Phase 1: canonicalize the target on a staged working copy.
            let target = GenotypeDataset::open(&args.dataset_prefix, build)?;
            let staged = target.stage(workspace.dir(), "target")?;
            let id_map = canonicalize(staged.variants());
            let canonical_target = staged.rewrite_ids(&id_map)?;

            // Phase 2: intersect with the same-build panel.
            let panel = ReferencePanel::open(&args.panel_dir, build)?;
            let pair = intersect(
                &canonical_target,
                &panel,
                &config,
                &runner,
                &budget,
                &workspace,
            )?;

            // Phase 3: projection and the one documented output file.
            let projection = run_projection(&pair, &config, &runner, &budget, &workspace)?;
            let out_path = output_path(&args.out_prefix);
            projection.write_tsv(&out_path)?;
            info!("wrote {}", out_path.display());
        }

        Command::Merge(args) => {
            let records = merge_tables(&args.inputs)?;
            write_merged(&args.out_path, &records)?;
            info!(
                "wrote {} ({} samples)",
                args.out_path.display(),
                records.len()
            );
        }
    }
    Ok(())
}
