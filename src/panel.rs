// The reference panel is built offline, once per genome build, and then
// reused read-only across every analysis run. Building is a pipeline of pure
// transformations over the variant metadata: canonicalize identities,
// optionally translate coordinates into a second build, filter to the
// standard chromosome set, and re-derive identifiers from the final
// coordinates. The one ordering constraint that matters is that coordinates
// are propagated into the dataset strictly before identifiers are
// regenerated; regenerating first would bake the old build's positions into
// the new panel's ids.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use log::{info, warn};
use thiserror::Error;

use crate::dataset::{DatasetError, GenomeBuild, GenotypeDataset};
use crate::resources::ResourceBudget;
use crate::tools::{
    CommandRunner, CoordinateMapper, GenotypeTool, ToolConfig, ToolError, Workspace,
    write_keep_list,
};
use crate::variant::{VariantRecord, canonicalize, is_standard_chromosome};

/// File stem every panel fileset uses inside its build directory.
const PANEL_STEM: &str = "panel";
/// Ancestry ground-truth labels, `SampleID<TAB>Label`, one row per labeled
/// reference sample.
const LABELS_FILE: &str = "panel.labels";

#[derive(Debug, Error)]
pub enum PanelError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("panel for build {build} already exists at '{dir}'; panels are written once")]
    AlreadyExists { build: GenomeBuild, dir: PathBuf },
    #[error("ancestry label file '{0}' is missing")]
    LabelsMissing(PathBuf),
    #[error("panel for build {build} not found under '{dir}'")]
    NotFound { build: GenomeBuild, dir: PathBuf },
}

/// A per-build, canonicalized reference panel: a genotype fileset plus the
/// ancestry ground truth for a subset of its samples.
#[derive(Debug)]
pub struct ReferencePanel {
    dataset: GenotypeDataset,
    labels_path: PathBuf,
}

impl ReferencePanel {
    /// Opens the panel for `build` under the panel root directory.
    pub fn open(panel_dir: &Path, build: GenomeBuild) -> Result<Self, PanelError> {
        let build_dir = panel_dir.join(build.to_string());
        let prefix = build_dir.join(PANEL_STEM);
        if !prefix.with_extension("bed").is_file() {
            return Err(PanelError::NotFound {
                build,
                dir: panel_dir.to_path_buf(),
            });
        }
        let labels_path = build_dir.join(LABELS_FILE);
        if !labels_path.is_file() {
            return Err(PanelError::LabelsMissing(labels_path));
        }
        let dataset = GenotypeDataset::open(&prefix, build)?;
        Ok(Self {
            dataset,
            labels_path,
        })
    }

    pub fn dataset(&self) -> &GenotypeDataset {
        &self.dataset
    }

    pub fn build(&self) -> GenomeBuild {
        self.dataset.build()
    }

    pub fn labels_path(&self) -> &Path {
        &self.labels_path
    }

    /// Ancestry ground truth as `SampleID -> label`.
    pub fn labels(&self) -> Result<AHashMap<String, String>, PanelError> {
        let file = File::open(&self.labels_path)?;
        let mut labels = AHashMap::new();
        for line_result in BufReader::new(file).lines() {
            let line = line_result?;
            let mut parts = line.split_whitespace();
            if let (Some(sample), Some(label)) = (parts.next(), parts.next()) {
                labels.insert(sample.to_string(), label.to_string());
            }
        }
        Ok(labels)
    }
}

/// Inputs for the offline panel build.
pub struct PanelBuildRequest<'a> {
    /// Prefix of the raw downloaded reference fileset.
    pub raw_prefix: &'a Path,
    /// Build the raw fileset is expressed in.
    pub source_build: GenomeBuild,
    /// Root directory panels are versioned under.
    pub panel_dir: &'a Path,
    /// Ancestry ground-truth labels for the reference samples.
    pub labels: &'a Path,
    /// When set, additionally produce a panel translated into this build
    /// using the given chain file.
    pub lift_to: Option<(GenomeBuild, &'a Path)>,
}

/// Builds the per-build reference panel(s) from a raw reference fileset.
///
/// The source-build panel is always produced. When translation is requested
/// a second, build-translated panel is derived from the canonicalized
/// source: unmapped and ambiguously-mapped variants are dropped (with the
/// count logged), non-standard contigs are filtered out after translation,
/// and canonical ids are re-derived from the translated coordinates.
pub fn build_panel<R: CommandRunner>(
    request: &PanelBuildRequest<'_>,
    config: &ToolConfig,
    runner: &R,
    budget: &ResourceBudget,
    workspace: &Workspace,
) -> Result<(), PanelError> {
    if !request.labels.is_file() {
        return Err(PanelError::LabelsMissing(request.labels.to_path_buf()));
    }

    let raw = GenotypeDataset::open(request.raw_prefix, request.source_build)?;
    let staged = raw.stage(workspace.dir(), "panel_source")?;
    let id_map = canonicalize(staged.variants());
    let canonical = staged.rewrite_ids(&id_map)?;

    install_panel(&canonical, request.panel_dir, request.labels)?;
    info!(
        "installed {} panel: {} variants, {} samples",
        canonical.build(),
        canonical.variants().len(),
        canonical.samples().len()
    );

    if let Some((target_build, chain)) = request.lift_to {
        let translated = translate_panel(
            &canonical,
            target_build,
            chain,
            config,
            runner,
            budget,
            workspace,
        )?;
        install_panel(&translated, request.panel_dir, request.labels)?;
        info!(
            "installed {} panel: {} variants, {} samples",
            translated.build(),
            translated.variants().len(),
            translated.samples().len()
        );
    }
    Ok(())
}

/// Derives a build-translated panel dataset from a canonicalized source.
fn translate_panel<R: CommandRunner>(
    canonical: &GenotypeDataset,
    target_build: GenomeBuild,
    chain: &Path,
    config: &ToolConfig,
    runner: &R,
    budget: &ResourceBudget,
    workspace: &Workspace,
) -> Result<GenotypeDataset, PanelError> {
    let mapper = CoordinateMapper::new(config, runner);
    let outcome = mapper.translate(canonical.variants(), chain, workspace.dir())?;
    if outcome.dropped > 0 {
        warn!(
            "{} of {} variants failed one-to-one coordinate translation to {target_build} and were dropped",
            outcome.dropped,
            canonical.variants().len()
        );
    }

    // Unmapped variants and variants landing on non-standard contigs are
    // removed in a single extraction pass; the contig filter applies to the
    // translated coordinates, not the source ones.
    let mut nonstandard = 0usize;
    let keep_ids: Vec<&str> = canonical
        .variants()
        .iter()
        .filter_map(|v| match outcome.mapped.get(&v.raw_id) {
            Some((chrom, _)) if is_standard_chromosome(chrom) => Some(v.raw_id.as_str()),
            Some(_) => {
                nonstandard += 1;
                None
            }
            None => None,
        })
        .collect();
    if nonstandard > 0 {
        info!("{nonstandard} translated variants fell on non-standard contigs and were dropped");
    }

    let keep_list = workspace.dir().join("translated_keep.txt");
    write_keep_list(&keep_list, keep_ids)?;
    let genotype_tool = GenotypeTool::new(config, runner);
    let lifted_prefix = workspace.dir().join("panel_translated");
    let lifted = genotype_tool.extract(canonical, &keep_list, &lifted_prefix, budget)?;

    // Coordinates first, identifier regeneration second. The ids written by
    // the rewrite below must be derived from the translated positions.
    let translated_variants: Vec<VariantRecord> = lifted
        .variants()
        .iter()
        .map(|v| {
            let mut v = v.clone();
            if let Some((chrom, position)) = outcome.mapped.get(&v.raw_id) {
                v.chrom = chrom.clone();
                v.position = *position;
            }
            v
        })
        .collect();
    let retagged = GenotypeDataset::open(lifted.prefix(), target_build)?;
    let with_coords = retagged.replace_variants(translated_variants)?;
    let id_map = canonicalize(with_coords.variants());
    Ok(with_coords.rewrite_ids(&id_map)?)
}

/// Copies a finished panel dataset and its labels into the versioned panel
/// directory. Refuses to overwrite: panels are written once and read-only
/// thereafter.
fn install_panel(
    dataset: &GenotypeDataset,
    panel_dir: &Path,
    labels: &Path,
) -> Result<(), PanelError> {
    let build_dir = panel_dir.join(dataset.build().to_string());
    fs::create_dir_all(&build_dir)?;
    let prefix = build_dir.join(PANEL_STEM);
    if prefix.with_extension("bed").exists() {
        return Err(PanelError::AlreadyExists {
            build: dataset.build(),
            dir: build_dir,
        });
    }

    for ext in ["bed", "bim", "fam"] {
        fs::copy(
            dataset.prefix().with_extension(ext),
            prefix.with_extension(ext),
        )?;
    }

    // Normalize the labels into the panel's own two-column file.
    let source = File::open(labels)?;
    let out = File::create(build_dir.join(LABELS_FILE))?;
    let mut writer = BufWriter::new(out);
    for line_result in BufReader::new(source).lines() {
        let line = line_result?;
        let mut parts = line.split_whitespace();
        if let (Some(sample), Some(label)) = (parts.next(), parts.next()) {
            writeln!(writer, "{sample}\t{label}")?;
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ScriptedRunner;
    use std::fs;

    fn write_fileset(dir: &Path, stem: &str, bim: &str, fam: &str) -> PathBuf {
        let prefix = dir.join(stem);
        fs::write(prefix.with_extension("bed"), "binary").unwrap();
        fs::write(prefix.with_extension("bim"), bim).unwrap();
        fs::write(prefix.with_extension("fam"), fam).unwrap();
        prefix
    }

    fn budget() -> ResourceBudget {
        ResourceBudget {
            threads: 1,
            memory_mb: 1000,
        }
    }

    #[test]
    fn source_build_panel_is_canonicalized_and_installed() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_fileset(
            dir.path(),
            "raw",
            "1\trs1\t0\t100\tG\tA\n2\trs2\t0\t200\tT\tC\n",
            "F1 R1 0 0 1 -9\nF2 R2 0 0 2 -9\n",
        );
        let labels = dir.path().join("labels.tsv");
        fs::write(&labels, "R1\tEUR\nR2\tAFR\n").unwrap();
        let panel_dir = dir.path().join("panels");
        let workspace = Workspace::at(&dir.path().join("work")).unwrap();

        let runner = ScriptedRunner::new(|_| panic!("no tool should run without translation"));
        let request = PanelBuildRequest {
            raw_prefix: &raw,
            source_build: GenomeBuild::Hg19,
            panel_dir: &panel_dir,
            labels: &labels,
            lift_to: None,
        };
        build_panel(&request, &ToolConfig::default(), &runner, &budget(), &workspace).unwrap();

        let panel = ReferencePanel::open(&panel_dir, GenomeBuild::Hg19).unwrap();
        let ids: Vec<_> = panel
            .dataset()
            .variants()
            .iter()
            .map(|v| v.raw_id.clone())
            .collect();
        assert_eq!(ids, vec!["chr1_100_A_G", "chr2_200_C_T"]);
        assert_eq!(panel.labels().unwrap().get("R1").map(String::as_str), Some("EUR"));
    }

    #[test]
    fn installing_twice_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_fileset(dir.path(), "raw", "1\trs1\t0\t100\tG\tA\n", "F R1 0 0 1 -9\n");
        let labels = dir.path().join("labels.tsv");
        fs::write(&labels, "R1\tEUR\n").unwrap();
        let panel_dir = dir.path().join("panels");

        let runner = ScriptedRunner::new(|_| Ok(()));
        let request = PanelBuildRequest {
            raw_prefix: &raw,
            source_build: GenomeBuild::Hg38,
            panel_dir: &panel_dir,
            labels: &labels,
            lift_to: None,
        };
        let workspace = Workspace::at(&dir.path().join("w1")).unwrap();
        build_panel(&request, &ToolConfig::default(), &runner, &budget(), &workspace).unwrap();

        let workspace = Workspace::at(&dir.path().join("w2")).unwrap();
        let err =
            build_panel(&request, &ToolConfig::default(), &runner, &budget(), &workspace)
                .unwrap_err();
        assert!(matches!(err, PanelError::AlreadyExists { .. }));
    }

    #[test]
    fn missing_labels_abort_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let raw = write_fileset(dir.path(), "raw", "1\trs1\t0\t100\tG\tA\n", "F R1 0 0 1 -9\n");
        let runner = ScriptedRunner::new(|_| Ok(()));
        let workspace = Workspace::at(&dir.path().join("work")).unwrap();
        let request = PanelBuildRequest {
            raw_prefix: &raw,
            source_build: GenomeBuild::Hg19,
            panel_dir: &dir.path().join("panels"),
            labels: &dir.path().join("nope.tsv"),
            lift_to: None,
        };
        let err =
            build_panel(&request, &ToolConfig::default(), &runner, &budget(), &workspace)
                .unwrap_err();
        assert!(matches!(err, PanelError::LabelsMissing(_)));
        assert!(!dir.path().join("panels").exists());
    }
}
