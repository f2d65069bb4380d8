use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ahash::AHashSet;
use log::info;
use thiserror::Error;

use crate::variant::{IdMap, VariantRecord};

/// Genome reference builds a panel can be versioned under.
///
/// A closed enum rather than a free-form tag: the build comparison at
/// intersection time is a hard precondition, and a typo'd tag must not be
/// able to slip past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenomeBuild {
    Hg19,
    Hg38,
}

impl fmt::Display for GenomeBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenomeBuild::Hg19 => f.write_str("hg19"),
            GenomeBuild::Hg38 => f.write_str("hg38"),
        }
    }
}

impl FromStr for GenomeBuild {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hg19" | "grch37" | "b37" => Ok(GenomeBuild::Hg19),
            "hg38" | "grch38" | "b38" => Ok(GenomeBuild::Hg38),
            other => Err(DatasetError::UnknownBuild(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed line {line} in '{path}': {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("unknown genome build tag '{0}' (expected hg19/hg38)")]
    UnknownBuild(String),
}

fn io_err(path: &Path, source: io::Error) -> DatasetError {
    DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A build-tagged handle on a genotype fileset triple.
///
/// The variant and sample metadata are held in memory in file order; the
/// binary genotype matrix is never read here, only referenced by path and
/// handed to the external genotype tool for subsetting.
#[derive(Debug, Clone)]
pub struct GenotypeDataset {
    prefix: PathBuf,
    build: GenomeBuild,
    variants: Vec<VariantRecord>,
    samples: Vec<String>,
}

impl GenotypeDataset {
    /// Opens the fileset at `prefix`, parsing the `.bim` and `.fam` files.
    pub fn open(prefix: &Path, build: GenomeBuild) -> Result<Self, DatasetError> {
        let bim_path = prefix.with_extension("bim");
        let fam_path = prefix.with_extension("fam");
        let variants = read_bim(&bim_path)?;
        let samples = read_fam_sample_ids(&fam_path)?;
        info!(
            "opened {} ({build}): {} variants, {} samples",
            prefix.display(),
            variants.len(),
            samples.len()
        );
        Ok(Self {
            prefix: prefix.to_path_buf(),
            build,
            variants,
            samples,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn build(&self) -> GenomeBuild {
        self.build
    }

    pub fn variants(&self) -> &[VariantRecord] {
        &self.variants
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn bed_path(&self) -> PathBuf {
        self.prefix.with_extension("bed")
    }

    pub fn bim_path(&self) -> PathBuf {
        self.prefix.with_extension("bim")
    }

    pub fn fam_path(&self) -> PathBuf {
        self.prefix.with_extension("fam")
    }

    /// The identifier column as currently written, as a set.
    pub fn id_set(&self) -> AHashSet<String> {
        self.variants.iter().map(|v| v.raw_id.clone()).collect()
    }

    /// Copies the fileset triple under a new prefix, yielding an independent
    /// working dataset. Inputs handed to us by the caller are never modified;
    /// all rewrites happen on a staged copy inside the run workspace.
    pub fn stage(&self, dir: &Path, name: &str) -> Result<Self, DatasetError> {
        let staged_prefix = dir.join(name);
        for ext in ["bed", "bim", "fam"] {
            let from = self.prefix.with_extension(ext);
            let to = staged_prefix.with_extension(ext);
            fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        }
        Ok(Self {
            prefix: staged_prefix,
            build: self.build,
            variants: self.variants.clone(),
            samples: self.samples.clone(),
        })
    }

    /// Rewrites the identifier column through `map`, consuming this dataset
    /// and producing the next one in the transformation chain. Rows absent
    /// from the map keep their original identifier; record order is
    /// preserved exactly.
    pub fn rewrite_ids(mut self, map: &IdMap) -> Result<Self, DatasetError> {
        for variant in &mut self.variants {
            if let Some(canonical) = map.get(&variant.raw_id) {
                variant.raw_id = canonical.to_string();
            }
        }
        write_bim(&self.bim_path(), &self.variants)?;
        Ok(self)
    }

    /// Replaces the variant rows wholesale (coordinate translation), writing
    /// the new `.bim`. The `.bed` is intentionally untouched; callers must
    /// only use this for transformations that preserve row identity, and go
    /// through the genotype tool for anything that changes cardinality.
    pub fn replace_variants(mut self, variants: Vec<VariantRecord>) -> Result<Self, DatasetError> {
        self.variants = variants;
        write_bim(&self.bim_path(), &self.variants)?;
        Ok(self)
    }
}

/// Parses a variant metadata file: `chrom  id  cm  position  allele1  allele2`.
pub fn read_bim(path: &Path) -> Result<Vec<VariantRecord>, DatasetError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut variants = Vec::new();

    for (index, line_result) in BufReader::new(file).lines().enumerate() {
        let line = line_result.map_err(|e| io_err(path, e))?;
        let mut parts = line.split_whitespace();
        let (Some(chrom), Some(raw_id), Some(cm), Some(pos), Some(a1), Some(a2)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(DatasetError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
                message: format!("expected 6 columns, got: {line}"),
            });
        };
        let position = pos.parse().map_err(|_| DatasetError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            message: format!("invalid position '{pos}'"),
        })?;
        variants.push(VariantRecord {
            chrom: chrom.to_string(),
            raw_id: raw_id.to_string(),
            cm: cm.to_string(),
            position,
            allele1: a1.to_string(),
            allele2: a2.to_string(),
        });
    }
    Ok(variants)
}

/// Writes a variant metadata file in the same 6-column layout it is read in.
pub fn write_bim(path: &Path, variants: &[VariantRecord]) -> Result<(), DatasetError> {
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut writer = BufWriter::new(file);
    for v in variants {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}",
            v.chrom, v.raw_id, v.cm, v.position, v.allele1, v.allele2
        )
        .map_err(|e| io_err(path, e))?;
    }
    writer.flush().map_err(|e| io_err(path, e))
}

/// Extracts the individual id (second column) from each sample metadata row.
pub fn read_fam_sample_ids(path: &Path) -> Result<Vec<String>, DatasetError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    BufReader::new(file)
        .lines()
        .enumerate()
        .map(|(index, line_result)| {
            let line = line_result.map_err(|e| io_err(path, e))?;
            let mut parts = line.split_whitespace();
            let _fid = parts.next();
            parts
                .next()
                .map(str::to_string)
                .ok_or_else(|| DatasetError::Malformed {
                    path: path.to_path_buf(),
                    line: index + 1,
                    message: "missing individual id column".to_string(),
                })
        })
        .collect()
}
