// Restricting the target and the reference panel to their common variant set
// is done direction-then-direction: first the target is cut down to the ids
// the panel knows, then the panel is cut down to the ids that survived in
// the reduced target. The second pass is what makes the result a true
// intersection; a single pass would leave the reference holding variants the
// target lost to genotyping or earlier filtering.

use ahash::AHashSet;
use log::info;
use thiserror::Error;

use crate::dataset::{DatasetError, GenomeBuild, GenotypeDataset};
use crate::panel::ReferencePanel;
use crate::resources::ResourceBudget;
use crate::tools::{CommandRunner, GenotypeTool, ToolConfig, ToolError, Workspace, write_keep_list};

#[derive(Debug, Error)]
pub enum IntersectError {
    #[error("genome build mismatch: target is {target}, reference panel is {panel}")]
    BuildMismatch {
        target: GenomeBuild,
        panel: GenomeBuild,
    },
    #[error(
        "no variants are shared between the target dataset and the reference panel; \
         projection cannot proceed"
    )]
    EmptyIntersection,
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The two reduced filesets, restricted to exactly the same variant set.
#[derive(Debug)]
pub struct IntersectedPair {
    pub target: GenotypeDataset,
    pub reference: GenotypeDataset,
}

/// Restricts `target` and the panel to their common canonical variant set.
///
/// Preconditions: both sides carry the same genome build (checked, fatal on
/// mismatch) and the intersection is non-empty (checked before the external
/// tool ever runs, so an empty overlap surfaces as a clear error here and
/// not as an opaque crash inside the projection tool).
pub fn intersect<R: CommandRunner>(
    target: &GenotypeDataset,
    panel: &ReferencePanel,
    config: &ToolConfig,
    runner: &R,
    budget: &ResourceBudget,
    workspace: &Workspace,
) -> Result<IntersectedPair, IntersectError> {
    if target.build() != panel.build() {
        return Err(IntersectError::BuildMismatch {
            target: target.build(),
            panel: panel.build(),
        });
    }

    let genotype_tool = GenotypeTool::new(config, runner);

    // Pass one: target restricted to the panel's ids.
    let panel_ids = panel.dataset().id_set();
    let target_keep: Vec<&str> = target
        .variants()
        .iter()
        .filter(|v| panel_ids.contains(&v.raw_id))
        .map(|v| v.raw_id.as_str())
        .collect();
    if target_keep.is_empty() {
        return Err(IntersectError::EmptyIntersection);
    }
    let target_keep_list = workspace.dir().join("target_keep.txt");
    write_keep_list(&target_keep_list, target_keep.iter().copied())?;
    let reduced_target = genotype_tool.extract(
        target,
        &target_keep_list,
        &workspace.dir().join("target_isec"),
        budget,
    )?;

    // Pass two: panel restricted to what actually survived in the target.
    let surviving: AHashSet<String> = reduced_target.id_set();
    let panel_keep: Vec<&str> = panel
        .dataset()
        .variants()
        .iter()
        .filter(|v| surviving.contains(&v.raw_id))
        .map(|v| v.raw_id.as_str())
        .collect();
    if panel_keep.is_empty() {
        return Err(IntersectError::EmptyIntersection);
    }
    let panel_keep_list = workspace.dir().join("panel_keep.txt");
    write_keep_list(&panel_keep_list, panel_keep.iter().copied())?;
    let reduced_reference = genotype_tool.extract(
        panel.dataset(),
        &panel_keep_list,
        &workspace.dir().join("reference_isec"),
        budget,
    )?;

    info!(
        "variant intersection: {} of {} target / {} panel variants retained",
        reduced_target.variants().len(),
        target.variants().len(),
        panel.dataset().variants().len()
    );
    Ok(IntersectedPair {
        target: reduced_target,
        reference: reduced_reference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ScriptedRunner, ToolInvocation};
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Emulates the genotype tool's extract: reads the source `.bim`, keeps
    /// the listed ids, writes the reduced fileset.
    fn scripted_extract(invocation: &ToolInvocation) -> Result<(), ToolError> {
        let arg_after = |flag: &str| -> PathBuf {
            let at = invocation.args.iter().position(|a| a == flag).unwrap();
            PathBuf::from(&invocation.args[at + 1])
        };
        let source = arg_after("--bfile");
        let keep: AHashSet<String> = fs::read_to_string(arg_after("--extract"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        let out = arg_after("--out");

        let kept: String = fs::read_to_string(source.with_extension("bim"))
            .unwrap()
            .lines()
            .filter(|line| {
                line.split_whitespace()
                    .nth(1)
                    .is_some_and(|id| keep.contains(id))
            })
            .map(|line| format!("{line}\n"))
            .collect();
        fs::write(out.with_extension("bim"), kept).unwrap();
        fs::copy(source.with_extension("fam"), out.with_extension("fam")).unwrap();
        fs::write(out.with_extension("bed"), "binary").unwrap();
        Ok(())
    }

    fn write_fileset(dir: &Path, stem: &str, ids: &[&str]) -> PathBuf {
        let prefix = dir.join(stem);
        let bim: String = ids
            .iter()
            .enumerate()
            .map(|(i, id)| format!("1\t{id}\t0\t{}\tG\tA\n", 100 + i))
            .collect();
        fs::write(prefix.with_extension("bim"), bim).unwrap();
        fs::write(prefix.with_extension("fam"), "F S1 0 0 1 -9\n").unwrap();
        fs::write(prefix.with_extension("bed"), "binary").unwrap();
        prefix
    }

    fn open_panel(dir: &Path, ids: &[&str], build: GenomeBuild) -> ReferencePanel {
        let build_dir = dir.join(build.to_string());
        fs::create_dir_all(&build_dir).unwrap();
        let bim: String = ids
            .iter()
            .enumerate()
            .map(|(i, id)| format!("1\t{id}\t0\t{}\tG\tA\n", 100 + i))
            .collect();
        fs::write(build_dir.join("panel.bim"), bim).unwrap();
        fs::write(build_dir.join("panel.fam"), "F R1 0 0 1 -9\n").unwrap();
        fs::write(build_dir.join("panel.bed"), "binary").unwrap();
        fs::write(build_dir.join("panel.labels"), "R1\tEUR\n").unwrap();
        ReferencePanel::open(dir, build).unwrap()
    }

    fn budget() -> ResourceBudget {
        ResourceBudget {
            threads: 1,
            memory_mb: 1000,
        }
    }

    fn id_list(dataset: &GenotypeDataset) -> Vec<String> {
        dataset.variants().iter().map(|v| v.raw_id.clone()).collect()
    }

    #[test]
    fn both_sides_reduce_to_the_true_intersection() {
        let dir = tempfile::tempdir().unwrap();
        let target_prefix = write_fileset(dir.path(), "target", &["v1", "v2", "v3"]);
        let target = GenotypeDataset::open(&target_prefix, GenomeBuild::Hg38).unwrap();
        let panel = open_panel(&dir.path().join("panels"), &["v2", "v3", "v4"], GenomeBuild::Hg38);
        let workspace = Workspace::at(&dir.path().join("work")).unwrap();

        let runner = ScriptedRunner::new(scripted_extract);
        let pair = intersect(
            &target,
            &panel,
            &ToolConfig::default(),
            &runner,
            &budget(),
            &workspace,
        )
        .unwrap();

        assert_eq!(id_list(&pair.target), vec!["v2", "v3"]);
        assert_eq!(id_list(&pair.reference), vec!["v2", "v3"]);
    }

    #[test]
    fn intersecting_a_dataset_with_itself_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ids = ["v1", "v2", "v3"];
        let target_prefix = write_fileset(dir.path(), "target", &ids);
        let target = GenotypeDataset::open(&target_prefix, GenomeBuild::Hg19).unwrap();
        let panel = open_panel(&dir.path().join("panels"), &ids, GenomeBuild::Hg19);
        let workspace = Workspace::at(&dir.path().join("work")).unwrap();

        let runner = ScriptedRunner::new(scripted_extract);
        let pair = intersect(
            &target,
            &panel,
            &ToolConfig::default(),
            &runner,
            &budget(),
            &workspace,
        )
        .unwrap();

        assert_eq!(id_list(&pair.target), id_list(&target));
        assert_eq!(id_list(&pair.reference), id_list(&target));
    }

    #[test]
    fn build_mismatch_fails_fast_without_running_any_tool() {
        let dir = tempfile::tempdir().unwrap();
        let target_prefix = write_fileset(dir.path(), "target", &["v1"]);
        let target = GenotypeDataset::open(&target_prefix, GenomeBuild::Hg19).unwrap();
        let panel = open_panel(&dir.path().join("panels"), &["v1"], GenomeBuild::Hg38);
        let workspace = Workspace::at(&dir.path().join("work")).unwrap();

        let runner = ScriptedRunner::new(|_| panic!("tool must not run on build mismatch"));
        let err = intersect(
            &target,
            &panel,
            &ToolConfig::default(),
            &runner,
            &budget(),
            &workspace,
        )
        .unwrap_err();
        assert!(matches!(err, IntersectError::BuildMismatch { .. }));
    }

    #[test]
    fn empty_intersection_is_an_explicit_error() {
        let dir = tempfile::tempdir().unwrap();
        let target_prefix = write_fileset(dir.path(), "target", &["v1", "v2"]);
        let target = GenotypeDataset::open(&target_prefix, GenomeBuild::Hg38).unwrap();
        let panel = open_panel(&dir.path().join("panels"), &["v8", "v9"], GenomeBuild::Hg38);
        let workspace = Workspace::at(&dir.path().join("work")).unwrap();

        let runner = ScriptedRunner::new(|_| panic!("tool must not run on empty intersection"));
        let err = intersect(
            &target,
            &panel,
            &ToolConfig::default(),
            &runner,
            &budget(),
            &workspace,
        )
        .unwrap_err();
        assert!(matches!(err, IntersectError::EmptyIntersection));
    }
}
