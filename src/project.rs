// The projection tool does the eigen work; this module's whole job is column
// plumbing. It runs the tool on the two intersected filesets, then selects,
// renames and pairs columns from the tool's two output tables: principal
// components 1-10 from the coordinate table, the projected ancestry label
// from the classification table. A sample with coordinates but no label is
// an expected case (reference-only or unclassifiable samples), not an error.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use csv::ReaderBuilder;
use log::info;
use thiserror::Error;

use crate::intersect::IntersectedPair;
use crate::resources::ResourceBudget;
use crate::tools::{CommandRunner, ProjectionTool, ToolConfig, ToolError, Workspace};

/// Number of principal components carried into the final record.
pub const NUM_PCS: usize = 10;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed table '{path}': {message}")]
    Table { path: PathBuf, message: String },
    #[error("could not parse '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// The documented destination of the PCA+ancestry table for a run:
/// `<out_prefix>.pca.tsv`, built by appending to the final path component.
/// `Path::with_extension` would eat a dotted prefix segment (`run.v2` ->
/// `run.pca.tsv`) and let distinct prefixes collide on one file.
pub fn output_path(out_prefix: &Path) -> PathBuf {
    let mut name = out_prefix
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".pca.tsv");
    out_prefix.with_file_name(name)
}

/// One projected sample: its PC coordinates and, when the tool could
/// classify it against the panel's ground truth, an ancestry label.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedSample {
    pub sample_id: String,
    pub pcs: Vec<f64>,
    pub ancestry: Option<String>,
}

/// Per-sample PCA coordinates and ancestry labels, in coordinate-table
/// order.
#[derive(Debug)]
pub struct AncestryProjection {
    pub samples: Vec<ProjectedSample>,
}

impl AncestryProjection {
    /// Writes the PCA+ancestry table consumed by the result assembler:
    /// `SampleID  PC1..PC10  Ancestry`, tab-separated, blank label where no
    /// classification exists.
    pub fn write_tsv(&self, path: &Path) -> Result<(), ProjectError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = vec!["SampleID".to_string()];
        header.extend((1..=NUM_PCS).map(|i| format!("PC{i}")));
        header.push("Ancestry".to_string());
        writeln!(writer, "{}", header.join("\t"))?;

        for sample in &self.samples {
            let mut fields = vec![sample.sample_id.clone()];
            fields.extend(sample.pcs.iter().map(|pc| pc.to_string()));
            fields.push(sample.ancestry.clone().unwrap_or_default());
            writeln!(writer, "{}", fields.join("\t"))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Runs the projection tool on an intersected pair and assembles the typed
/// per-sample projection from its two output tables.
pub fn run_projection<R: CommandRunner>(
    pair: &IntersectedPair,
    config: &ToolConfig,
    runner: &R,
    budget: &ResourceBudget,
    workspace: &Workspace,
) -> Result<AncestryProjection, ProjectError> {
    let tool = ProjectionTool::new(config, runner);
    let out_prefix = workspace.dir().join("projection");
    let output = tool.project(&pair.target, &pair.reference, &out_prefix, budget)?;

    let labels = read_ancestry_table(&output.ancestry_path)?;
    let samples = read_coord_table(&output.coord_path, &labels)?;
    info!(
        "projection produced coordinates for {} samples ({} with ancestry labels)",
        samples.len(),
        samples.iter().filter(|s| s.ancestry.is_some()).count()
    );
    Ok(AncestryProjection { samples })
}

/// Parses the coordinate table: tab-separated with a header row, sample id
/// in the first column, principal components in columns named `PC1..PCn`.
fn read_coord_table(
    path: &Path,
    labels: &AHashMap<String, String>,
) -> Result<Vec<ProjectedSample>, ProjectError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|source| ProjectError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    let headers = reader
        .headers()
        .map_err(|source| ProjectError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let pc_columns: Vec<usize> = (1..=NUM_PCS)
        .map(|i| {
            let name = format!("PC{i}");
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| ProjectError::Table {
                    path: path.to_path_buf(),
                    message: format!("missing column '{name}'"),
                })
        })
        .collect::<Result<_, _>>()?;

    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| ProjectError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let Some(sample_id) = record.get(0).filter(|s| !s.is_empty()) else {
            continue;
        };
        let pcs = pc_columns
            .iter()
            .enumerate()
            .map(|(i, &col)| {
                record
                    .get(col)
                    .and_then(|v| v.parse::<f64>().ok())
                    .ok_or_else(|| ProjectError::Table {
                        path: path.to_path_buf(),
                        message: format!(
                            "sample '{sample_id}' has no numeric value in column 'PC{}'",
                            i + 1
                        ),
                    })
            })
            .collect::<Result<Vec<f64>, _>>()?;
        samples.push(ProjectedSample {
            sample_id: sample_id.to_string(),
            pcs,
            ancestry: labels.get(sample_id).cloned(),
        });
    }
    Ok(samples)
}

/// Parses the classification table: tab-separated with a header row, sample
/// id in the first column, label in the column named `Ancestry` (falling
/// back to the second column for tools that name it after their panel).
fn read_ancestry_table(path: &Path) -> Result<AHashMap<String, String>, ProjectError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|source| ProjectError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    let headers = reader
        .headers()
        .map_err(|source| ProjectError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let label_column = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("ancestry"))
        .unwrap_or(1);

    let mut labels = AHashMap::new();
    for record in reader.records() {
        let record = record.map_err(|source| ProjectError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        if let (Some(sample), Some(label)) = (record.get(0), record.get(label_column)) {
            if !sample.is_empty() && !label.is_empty() {
                labels.insert(sample.to_string(), label.to_string());
            }
        }
    }
    Ok(labels)
}
