// External analytic binaries are opaque collaborators: the genotype tool for
// fileset subsetting, the coordinate-mapping tool for cross-build liftover,
// and the projection tool for the reference-projected PCA. Each one sits
// behind a typed adapter with an explicit input and output contract, so the
// rest of the engine never builds command lines ad hoc and tests can swap in
// a fake runner instead of a real binary.

use std::env;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use ahash::{AHashMap, AHashSet};
use log::{info, warn};
use serde::Deserialize;
use tempfile::TempDir;
use thiserror::Error;

use crate::dataset::{DatasetError, GenotypeDataset};
use crate::resources::ResourceBudget;
use crate::variant::VariantRecord;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("required binary '{0}' was not found on PATH")]
    MissingTool(String),
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },
    #[error("{tool} reported success but expected output '{path}' is missing or empty")]
    IncompleteOutput { tool: String, path: PathBuf },
    #[error("liftover cardinality violated: {input} input variants != {mapped} mapped + {dropped} dropped")]
    CardinalityMismatch {
        input: usize,
        mapped: usize,
        dropped: usize,
    },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not read configuration '{path}': {message}")]
    Config { path: PathBuf, message: String },
}

/// Names of the external binaries, overridable via an optional TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub genotype_tool: String,
    pub liftover_tool: String,
    pub projection_tool: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            genotype_tool: "plink2".to_string(),
            liftover_tool: "liftOver".to_string(),
            projection_tool: "trace".to_string(),
        }
    }
}

impl ToolConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ToolError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|e| ToolError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&text).map_err(|e| ToolError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// One fully-formed external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolInvocation {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            args,
        }
    }
}

/// Executes tool invocations. Production code uses [`SystemRunner`]; tests
/// substitute fakes that fabricate the expected output files.
pub trait CommandRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError>;
}

/// Runs invocations as real subprocesses, blocking until exit.
///
/// The binary is resolved on PATH before anything is spawned, so a missing
/// tool aborts with no side effects.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        let program = resolve_binary(&invocation.program)?;
        info!(
            "running {} {}",
            invocation.program,
            invocation.args.join(" ")
        );
        let output = Command::new(&program).args(&invocation.args).output()?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: invocation.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Locates `name` on PATH (or verifies an explicit path), requiring an
/// executable regular file.
pub fn resolve_binary(name: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        if is_executable(candidate) {
            return Ok(candidate.to_path_buf());
        }
        return Err(ToolError::MissingTool(name.to_string()));
    }

    let search_path = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&search_path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ToolError::MissingTool(name.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Appends `suffix` to the final path component. Unlike
/// `Path::with_extension` this never swallows a dot already present in the
/// component, so dotted prefixes keep their full name.
fn append_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map(std::ffi::OsString::from)
        .unwrap_or_default();
    name.push(suffix);
    prefix.with_file_name(name)
}

fn require_output(tool: &str, path: &Path) -> Result<(), ToolError> {
    let nonempty = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    if nonempty {
        Ok(())
    } else {
        Err(ToolError::IncompleteOutput {
            tool: tool.to_string(),
            path: path.to_path_buf(),
        })
    }
}

// ========================================================================================
//                                   RUN WORKSPACE
// ========================================================================================

/// The exclusive scratch directory of one run.
///
/// Intermediate fileset names inside a workspace are fixed, so two runs must
/// never share one. An owned workspace is removed with everything in it when
/// dropped; a caller-supplied directory is created if needed and left in
/// place for the workflow engine to manage.
#[derive(Debug)]
pub enum Workspace {
    Owned(TempDir),
    Caller(PathBuf),
}

impl Workspace {
    pub fn ephemeral() -> Result<Self, ToolError> {
        Ok(Workspace::Owned(TempDir::with_prefix("astrolabe.")?))
    }

    pub fn at(dir: &Path) -> Result<Self, ToolError> {
        fs::create_dir_all(dir)?;
        Ok(Workspace::Caller(dir.to_path_buf()))
    }

    pub fn dir(&self) -> &Path {
        match self {
            Workspace::Owned(tmp) => tmp.path(),
            Workspace::Caller(dir) => dir,
        }
    }
}

// ========================================================================================
//                                 GENOTYPE TOOL ADAPTER
// ========================================================================================

/// Adapter over the external genotype tool, used for everything that touches
/// the binary genotype matrix.
pub struct GenotypeTool<'r, R: CommandRunner> {
    program: String,
    runner: &'r R,
}

impl<'r, R: CommandRunner> GenotypeTool<'r, R> {
    pub fn new(config: &ToolConfig, runner: &'r R) -> Self {
        Self {
            program: config.genotype_tool.clone(),
            runner,
        }
    }

    /// Restricts `dataset` to the variant ids listed one-per-line in
    /// `keep_list`, producing a new fileset triple at `out_prefix`.
    pub fn extract(
        &self,
        dataset: &GenotypeDataset,
        keep_list: &Path,
        out_prefix: &Path,
        budget: &ResourceBudget,
    ) -> Result<GenotypeDataset, ToolError> {
        let invocation = ToolInvocation::new(
            &self.program,
            vec![
                "--bfile".to_string(),
                dataset.prefix().display().to_string(),
                "--extract".to_string(),
                keep_list.display().to_string(),
                "--make-bed".to_string(),
                "--threads".to_string(),
                budget.threads.to_string(),
                "--memory".to_string(),
                budget.memory_mb.to_string(),
                "--out".to_string(),
                out_prefix.display().to_string(),
            ],
        );
        self.runner.run(&invocation)?;
        for ext in ["bed", "bim", "fam"] {
            require_output(&self.program, &out_prefix.with_extension(ext))?;
        }
        Ok(GenotypeDataset::open(out_prefix, dataset.build())?)
    }
}

/// Writes a one-id-per-line keep list for [`GenotypeTool::extract`].
pub fn write_keep_list<'a>(
    path: &Path,
    ids: impl IntoIterator<Item = &'a str>,
) -> Result<(), ToolError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for id in ids {
        writeln!(writer, "{id}")?;
    }
    writer.flush()?;
    Ok(())
}

// ========================================================================================
//                             COORDINATE-MAPPING ADAPTER
// ========================================================================================

/// Result of translating a variant set between builds. Keyed by the variant
/// id as written in the source dataset.
#[derive(Debug)]
pub struct TranslationOutcome {
    pub mapped: AHashMap<String, (String, u64)>,
    pub dropped: usize,
}

/// Adapter over the external coordinate-mapping tool.
///
/// The exchange format is a minimal interval file: `chrom  start  end  id`
/// with half-open zero-based intervals, one row per variant.
pub struct CoordinateMapper<'r, R: CommandRunner> {
    program: String,
    runner: &'r R,
}

impl<'r, R: CommandRunner> CoordinateMapper<'r, R> {
    pub fn new(config: &ToolConfig, runner: &'r R) -> Self {
        Self {
            program: config.liftover_tool.clone(),
            runner,
        }
    }

    /// Translates every variant's coordinates through `chain`, enforcing a
    /// one-to-one mapping. Variants that fail to map, or map more than once,
    /// are dropped and counted; the count is the caller's to log. The
    /// cardinality identity `mapped + dropped == input` is checked here so a
    /// silent loss can never corrupt downstream identifiers.
    pub fn translate(
        &self,
        variants: &[VariantRecord],
        chain: &Path,
        scratch: &Path,
    ) -> Result<TranslationOutcome, ToolError> {
        let source = scratch.join("liftover_source.bed");
        let mapped_path = scratch.join("liftover_mapped.bed");
        let unmapped_path = scratch.join("liftover_unmapped.bed");

        {
            let file = File::create(&source)?;
            let mut writer = BufWriter::new(file);
            for v in variants {
                // Chain files use chr-prefixed names; 1-based position maps
                // to a half-open zero-based interval.
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}",
                    crate::variant::normalize_chromosome(&v.chrom),
                    v.position.saturating_sub(1),
                    v.position,
                    v.raw_id
                )?;
            }
            writer.flush()?;
        }

        let invocation = ToolInvocation::new(
            &self.program,
            vec![
                source.display().to_string(),
                chain.display().to_string(),
                mapped_path.display().to_string(),
                unmapped_path.display().to_string(),
            ],
        );
        self.runner.run(&invocation)?;
        require_output(&self.program, &mapped_path)?;

        let mut mapped: AHashMap<String, (String, u64)> = AHashMap::new();
        let mut ambiguous: AHashSet<String> = AHashSet::new();
        let file = File::open(&mapped_path)?;
        for line_result in BufReader::new(file).lines() {
            let line = line_result?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(chrom), Some(start), Some(_end), Some(id)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(start) = start.parse::<u64>() else {
                continue;
            };
            if mapped.insert(id.to_string(), (chrom.to_string(), start + 1)).is_some() {
                // A second interval for the same id means the mapping was
                // not one-to-one; the id is rejected entirely.
                ambiguous.insert(id.to_string());
            }
        }
        for id in &ambiguous {
            warn!("variant '{id}' mapped ambiguously and was dropped");
            mapped.remove(id);
        }

        let dropped = variants
            .iter()
            .filter(|v| !mapped.contains_key(&v.raw_id))
            .count();
        if mapped.len() + dropped != variants.len() {
            return Err(ToolError::CardinalityMismatch {
                input: variants.len(),
                mapped: mapped.len(),
                dropped,
            });
        }
        Ok(TranslationOutcome { mapped, dropped })
    }
}

// ========================================================================================
//                                 PROJECTION ADAPTER
// ========================================================================================

/// Paths of the two tables the projection tool writes.
#[derive(Debug, Clone)]
pub struct ProjectionOutput {
    /// Per-sample principal component coordinates.
    pub coord_path: PathBuf,
    /// Per-sample projected ancestry labels, covering the samples the tool
    /// could classify against the panel's ground truth.
    pub ancestry_path: PathBuf,
}

/// Adapter over the external ancestry projection tool.
pub struct ProjectionTool<'r, R: CommandRunner> {
    program: String,
    runner: &'r R,
}

impl<'r, R: CommandRunner> ProjectionTool<'r, R> {
    pub fn new(config: &ToolConfig, runner: &'r R) -> Self {
        Self {
            program: config.projection_tool.clone(),
            runner,
        }
    }

    /// Projects `target` onto the PCA space of `reference`. Both filesets
    /// must already be restricted to the same variant set. Positional
    /// argument order is the tool's fixed contract: target prefix, reference
    /// prefix, output prefix.
    pub fn project(
        &self,
        target: &GenotypeDataset,
        reference: &GenotypeDataset,
        out_prefix: &Path,
        budget: &ResourceBudget,
    ) -> Result<ProjectionOutput, ToolError> {
        let invocation = ToolInvocation::new(
            &self.program,
            vec![
                target.prefix().display().to_string(),
                reference.prefix().display().to_string(),
                out_prefix.display().to_string(),
                "--threads".to_string(),
                budget.threads.to_string(),
                "--memory".to_string(),
                budget.memory_mb.to_string(),
            ],
        );
        self.runner.run(&invocation)?;

        let output = ProjectionOutput {
            coord_path: append_suffix(out_prefix, ".ProPC.coord"),
            ancestry_path: append_suffix(out_prefix, ".popref"),
        };
        require_output(&self.program, &output.coord_path)?;
        require_output(&self.program, &output.ancestry_path)?;
        Ok(output)
    }
}

/// Scripted runner: records every invocation and applies a caller-provided
/// effect (typically fabricating the tool's output files) instead of
/// spawning a process. This is the substitution point the adapter seam
/// exists for; tests use it so no real binary is ever required.
pub struct ScriptedRunner<F: Fn(&ToolInvocation) -> Result<(), ToolError>> {
    invocations: std::cell::RefCell<Vec<ToolInvocation>>,
    effect: F,
}

impl<F: Fn(&ToolInvocation) -> Result<(), ToolError>> ScriptedRunner<F> {
    pub fn new(effect: F) -> Self {
        Self {
            invocations: std::cell::RefCell::new(Vec::new()),
            effect,
        }
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.invocations.borrow().clone()
    }
}

impl<F: Fn(&ToolInvocation) -> Result<(), ToolError>> CommandRunner for ScriptedRunner<F> {
    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        self.invocations.borrow_mut().push(invocation.clone());
        (self.effect)(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(chrom: &str, id: &str, pos: u64) -> VariantRecord {
        VariantRecord {
            chrom: chrom.to_string(),
            raw_id: id.to_string(),
            cm: "0".to_string(),
            position: pos,
            allele1: "G".to_string(),
            allele2: "A".to_string(),
        }
    }

    #[test]
    fn missing_binary_is_detected_before_any_side_effect() {
        let err = resolve_binary("definitely-not-a-real-tool-name").unwrap_err();
        assert!(matches!(err, ToolError::MissingTool(_)));
    }

    #[test]
    fn default_config_used_when_no_file_given() {
        let config = ToolConfig::load(None).unwrap();
        assert_eq!(config.genotype_tool, "plink2");
        assert_eq!(config.liftover_tool, "liftOver");
        assert_eq!(config.projection_tool, "trace");
    }

    #[test]
    fn config_file_overrides_tool_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tools.toml");
        fs::write(&path, "genotype_tool = \"plink2_avx2\"\n").unwrap();
        let config = ToolConfig::load(Some(&path)).unwrap();
        assert_eq!(config.genotype_tool, "plink2_avx2");
        assert_eq!(config.projection_tool, "trace");
    }

    #[test]
    fn translation_counts_unmapped_and_rejects_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().to_path_buf();
        let variants = vec![
            variant("chr1", "v1", 100),
            variant("chr1", "v2", 200),
            variant("chr2", "v3", 300),
        ];

        // v1 maps cleanly, v2 maps twice (ambiguous), v3 does not map.
        let mapped_out = scratch.join("liftover_mapped.bed");
        let runner = ScriptedRunner::new(move |_| {
            fs::write(
                &mapped_out,
                "chr1\t499\t500\tv1\nchr1\t600\t601\tv2\nchr9\t10\t11\tv2\n",
            )
            .unwrap();
            Ok(())
        });

        let mapper = CoordinateMapper::new(&ToolConfig::default(), &runner);
        let outcome = mapper
            .translate(&variants, Path::new("builds.chain"), &scratch)
            .unwrap();

        assert_eq!(outcome.mapped.len(), 1);
        assert_eq!(outcome.dropped, 2);
        assert_eq!(
            outcome.mapped.get("v1"),
            Some(&("chr1".to_string(), 500u64))
        );
        assert_eq!(outcome.mapped.len() + outcome.dropped, variants.len());
    }

    #[test]
    fn projection_reports_missing_output_with_tool_and_path() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["t", "r"] {
            for ext in ["bed", "bim", "fam"] {
                fs::write(dir.path().join(format!("{name}.{ext}")), "x").unwrap();
            }
            fs::write(
                dir.path().join(format!("{name}.bim")),
                "1\tchr1_100_A_G\t0\t100\tG\tA\n",
            )
            .unwrap();
            fs::write(dir.path().join(format!("{name}.fam")), "F S 0 0 1 -9\n").unwrap();
        }
        let target =
            GenotypeDataset::open(&dir.path().join("t"), crate::dataset::GenomeBuild::Hg38)
                .unwrap();
        let reference =
            GenotypeDataset::open(&dir.path().join("r"), crate::dataset::GenomeBuild::Hg38)
                .unwrap();

        // The tool "succeeds" but writes neither output table.
        let runner = ScriptedRunner::new(|_| Ok(()));
        let tool = ProjectionTool::new(&ToolConfig::default(), &runner);
        let budget = ResourceBudget {
            threads: 1,
            memory_mb: 1000,
        };
        let err = tool
            .project(&target, &reference, &dir.path().join("out.v1"), &budget)
            .unwrap_err();
        match err {
            ToolError::IncompleteOutput { tool, path } => {
                assert_eq!(tool, "trace");
                // A dot in the prefix stays part of the output name.
                assert!(path.to_string_lossy().ends_with("out.v1.ProPC.coord"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn extract_passes_resource_flags_and_opens_the_result() {
        let dir = tempfile::tempdir().unwrap();
        for ext in ["bed", "bim", "fam"] {
            fs::write(dir.path().join(format!("in.{ext}")), "x").unwrap();
        }
        fs::write(dir.path().join("in.bim"), "1\tchr1_100_A_G\t0\t100\tG\tA\n").unwrap();
        fs::write(dir.path().join("in.fam"), "F S1 0 0 1 -9\n").unwrap();
        let dataset =
            GenotypeDataset::open(&dir.path().join("in"), crate::dataset::GenomeBuild::Hg19)
                .unwrap();

        let out_prefix = dir.path().join("out");
        let fabricate = out_prefix.clone();
        let runner = ScriptedRunner::new(move |_| {
            fs::write(fabricate.with_extension("bed"), "x").unwrap();
            fs::write(
                fabricate.with_extension("bim"),
                "1\tchr1_100_A_G\t0\t100\tG\tA\n",
            )
            .unwrap();
            fs::write(fabricate.with_extension("fam"), "F S1 0 0 1 -9\n").unwrap();
            Ok(())
        });

        let keep = dir.path().join("keep.txt");
        write_keep_list(&keep, ["chr1_100_A_G"]).unwrap();

        let tool = GenotypeTool::new(&ToolConfig::default(), &runner);
        let budget = ResourceBudget {
            threads: 4,
            memory_mb: 28800,
        };
        let result = tool.extract(&dataset, &keep, &out_prefix, &budget).unwrap();
        assert_eq!(result.variants().len(), 1);

        let invocations = runner.invocations();
        let args = &invocations[0].args;
        assert_eq!(invocations[0].program, "plink2");
        let threads_at = args.iter().position(|a| a == "--threads").unwrap();
        assert_eq!(args[threads_at + 1], "4");
        let memory_at = args.iter().position(|a| a == "--memory").unwrap();
        assert_eq!(args[memory_at + 1], "28800");
    }
}
