// The terminal artifact of a run: one row per sample, assembled from the
// call-rate/sex table, the pedigree table and the PCA/ancestry table by a
// full outer join on SampleID. Every SampleID seen in any contributing table
// gets a row; fields the contributing tables lack stay blank. The join is a
// fold over keyed record maps, so neither the sample set nor any field value
// depends on which table is folded first.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ahash::AHashMap;
use csv::ReaderBuilder;
use itertools::Itertools;
use log::warn;
use thiserror::Error;

use crate::project::NUM_PCS;

/// Column order of the merged table. Fixed by contract; consumers index by
/// header but humans diff these files.
pub const MERGED_COLUMNS: [&str; 17] = [
    "SampleID",
    "Call_Rate",
    "Sex",
    "FatherID",
    "MotherID",
    "FamilyID",
    "PC1",
    "PC2",
    "PC3",
    "PC4",
    "PC5",
    "PC6",
    "PC7",
    "PC8",
    "PC9",
    "PC10",
    "Ancestry",
];

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not parse '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("'SampleID' column missing in '{0}'")]
    MissingKeyColumn(PathBuf),
    #[error("bad value '{value}' for {column} of sample '{sample}' in '{path}'")]
    BadValue {
        path: PathBuf,
        sample: String,
        column: String,
        value: String,
    },
    #[error("no input tables were provided")]
    NoInputs,
}

/// Sex as called from genotype data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SexCall {
    Male,
    Female,
    Unknown,
}

impl fmt::Display for SexCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SexCall::Male => f.write_str("male"),
            SexCall::Female => f.write_str("female"),
            SexCall::Unknown => f.write_str("unknown"),
        }
    }
}

impl FromStr for SexCall {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "male" | "m" | "1" => Ok(SexCall::Male),
            "female" | "f" | "2" => Ok(SexCall::Female),
            "unknown" | "0" => Ok(SexCall::Unknown),
            _ => Err(()),
        }
    }
}

/// One fully merged per-sample record. Absent fields are `None` and render
/// as blanks, never as a dropped row.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample_id: String,
    pub call_rate: Option<f64>,
    pub sex: Option<SexCall>,
    pub father_id: Option<String>,
    pub mother_id: Option<String>,
    pub family_id: Option<String>,
    pub pcs: Vec<Option<f64>>,
    pub ancestry: Option<String>,
}

impl SampleRecord {
    fn blank(sample_id: &str) -> Self {
        Self {
            sample_id: sample_id.to_string(),
            call_rate: None,
            sex: None,
            father_id: None,
            mother_id: None,
            family_id: None,
            pcs: vec![None; NUM_PCS],
            ancestry: None,
        }
    }
}

/// Performs the full outer join across the given tables.
///
/// Each table is tab-separated with a header row and must carry a
/// `SampleID` column; all other recognized columns contribute fields, and
/// unrecognized columns are ignored with a warning. The result is sorted by
/// natural SampleID order so reruns produce byte-identical output.
pub fn merge_tables(paths: &[PathBuf]) -> Result<Vec<SampleRecord>, MergeError> {
    if paths.is_empty() {
        return Err(MergeError::NoInputs);
    }

    let mut records: AHashMap<String, SampleRecord> = AHashMap::new();
    for path in paths {
        fold_table(path, &mut records)?;
    }

    Ok(records
        .into_values()
        .sorted_by(|a, b| natord::compare(&a.sample_id, &b.sample_id))
        .collect())
}

/// Folds one keyed table into the accumulated record map.
fn fold_table(
    path: &Path,
    records: &mut AHashMap<String, SampleRecord>,
) -> Result<(), MergeError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|source| MergeError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    let headers = reader
        .headers()
        .map_err(|source| MergeError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let key_column = headers
        .iter()
        .position(|h| h == "SampleID")
        .ok_or_else(|| MergeError::MissingKeyColumn(path.to_path_buf()))?;
    for header in headers.iter() {
        if header != "SampleID" && !MERGED_COLUMNS.contains(&header) {
            warn!("ignoring unrecognized column '{header}' in '{}'", path.display());
        }
    }

    for row in reader.records() {
        let row = row.map_err(|source| MergeError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let Some(sample_id) = row.get(key_column).filter(|s| !s.is_empty()) else {
            continue;
        };
        let record = records
            .entry(sample_id.to_string())
            .or_insert_with(|| SampleRecord::blank(sample_id));

        for (column, value) in headers.iter().zip(row.iter()) {
            if value.is_empty() || column == "SampleID" {
                continue;
            }
            apply_field(record, column, value).map_err(|()| MergeError::BadValue {
                path: path.to_path_buf(),
                sample: sample_id.to_string(),
                column: column.to_string(),
                value: value.to_string(),
            })?;
        }
    }
    Ok(())
}

fn apply_field(record: &mut SampleRecord, column: &str, value: &str) -> Result<(), ()> {
    match column {
        "Call_Rate" => {
            let rate: f64 = value.parse().map_err(|_| ())?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(());
            }
            record.call_rate = Some(rate);
        }
        "Sex" => record.sex = Some(value.parse()?),
        "FatherID" => record.father_id = some_id(value),
        "MotherID" => record.mother_id = some_id(value),
        "FamilyID" => record.family_id = some_id(value),
        "Ancestry" => record.ancestry = Some(value.to_string()),
        _ => {
            if let Some(index) = column
                .strip_prefix("PC")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| (1..=NUM_PCS).contains(n))
            {
                record.pcs[index - 1] = Some(value.parse().map_err(|_| ())?);
            }
        }
    }
    Ok(())
}

/// Pedigree files use `0` for "no parent recorded"; that is an absent value,
/// not an identifier.
fn some_id(value: &str) -> Option<String> {
    if value == "0" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Writes the merged table with the fixed column order and a mandatory
/// header row.
pub fn write_merged(path: &Path, records: &[SampleRecord]) -> Result<(), MergeError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", MERGED_COLUMNS.join("\t"))?;

    let mut line = String::new();
    for record in records {
        line.clear();
        line.push_str(&record.sample_id);
        push_field(&mut line, &record.call_rate.map(|v| v.to_string()));
        push_field(&mut line, &record.sex.map(|v| v.to_string()));
        push_field(&mut line, &record.father_id);
        push_field(&mut line, &record.mother_id);
        push_field(&mut line, &record.family_id);
        for pc in &record.pcs {
            push_field(&mut line, &pc.map(|v| v.to_string()));
        }
        push_field(&mut line, &record.ancestry);
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

fn push_field(line: &mut String, value: &Option<String>) {
    line.push('\t');
    if let Some(value) = value {
        line.push_str(value);
    }
}
