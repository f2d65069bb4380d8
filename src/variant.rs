use ahash::{AHashMap, AHashSet};
use log::info;

/// One row of a variant metadata file, in file order.
///
/// `allele1` is the alternate allele and `allele2` the reference allele,
/// following the fileset convention. `cm` is the unused third column, carried
/// verbatim so a rewrite round-trips the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRecord {
    pub chrom: String,
    pub raw_id: String,
    pub cm: String,
    pub position: u64,
    pub allele1: String,
    pub allele2: String,
}

impl VariantRecord {
    /// Canonical identity of this variant: `{chrom}_{pos}_{ref}_{alt}` with a
    /// normalized `chr`-prefixed chromosome token. Two independently curated
    /// datasets agree on this string for the same physical variant.
    pub fn canonical_id(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            normalize_chromosome(&self.chrom),
            self.position,
            self.allele2,
            self.allele1
        )
    }
}

/// Normalizes a chromosome token to its `chr`-prefixed spelling.
///
/// An optional leading `chr` (any case) is stripped and re-added, the body is
/// upper-cased, and the `MT` spelling of the mitochondrial contig collapses
/// to `M`.
pub fn normalize_chromosome(chrom: &str) -> String {
    let mut body = chrom.trim();
    // get() rather than a direct slice: a non-ASCII token must pass through
    // unshortened, not panic on a char boundary.
    if body
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("chr"))
    {
        body = &body[3..];
    }
    let body = body.to_ascii_uppercase();
    let body = if body == "MT" { "M".to_string() } else { body };
    format!("chr{body}")
}

/// True for the contigs that are analytically meaningful: autosomes 1-22, X,
/// Y and the mitochondrial contig. Unplaced and alternate contigs fail this.
pub fn is_standard_chromosome(chrom: &str) -> bool {
    let normalized = normalize_chromosome(chrom);
    let body = &normalized[3..];
    match body {
        "X" | "Y" | "M" => true,
        _ => matches!(body.parse::<u8>(), Ok(n) if (1..=22).contains(&n)),
    }
}

/// Raw-to-canonical identifier mapping for one dataset.
#[derive(Debug, Default, Clone)]
pub struct IdMap {
    map: AHashMap<String, String>,
}

impl IdMap {
    pub fn get(&self, raw_id: &str) -> Option<&str> {
        self.map.get(raw_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Assigns canonical identifiers to a sequence of variant rows.
///
/// Only the first occurrence of each canonical identity is entered into the
/// map; later duplicates are discarded without touching the earlier entry.
/// The silent drop is deliberate policy: duplicate physical variants in a
/// genotyping export carry no extra information, and the first-seen raw id is
/// the stable tie-break. Rows whose raw id is absent from the returned map
/// keep their original identifier when the file is rewritten, so record
/// order and cardinality of the dataset itself are untouched.
pub fn canonicalize(variants: &[VariantRecord]) -> IdMap {
    let mut seen: AHashSet<String> = AHashSet::with_capacity(variants.len());
    let mut map = AHashMap::with_capacity(variants.len());

    for variant in variants {
        let canonical = variant.canonical_id();
        if seen.insert(canonical.clone()) {
            map.insert(variant.raw_id.clone(), canonical);
        }
    }

    info!(
        "canonicalized {} of {} variant ids",
        map.len(),
        variants.len()
    );
    IdMap { map }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chrom: &str, raw_id: &str, position: u64, a1: &str, a2: &str) -> VariantRecord {
        VariantRecord {
            chrom: chrom.to_string(),
            raw_id: raw_id.to_string(),
            cm: "0".to_string(),
            position,
            allele1: a1.to_string(),
            allele2: a2.to_string(),
        }
    }

    #[test]
    fn chromosome_normalization_is_idempotent() {
        assert_eq!(normalize_chromosome("1"), "chr1");
        assert_eq!(normalize_chromosome("chr1"), "chr1");
        assert_eq!(normalize_chromosome("CHRX"), "chrX");
        assert_eq!(normalize_chromosome("chrchr5"), "chrCHR5");
        assert_eq!(normalize_chromosome("MT"), "chrM");
        assert_eq!(normalize_chromosome("chrM"), "chrM");
    }

    #[test]
    fn non_ascii_tokens_pass_through_without_panicking() {
        // Garbage contigs with multibyte bytes near the prefix boundary must
        // come out prefixed, never abort the parse.
        assert_eq!(normalize_chromosome("ch€"), "chrCH€");
        assert_eq!(normalize_chromosome("€1"), "chr€1");
        assert!(!is_standard_chromosome("ch€"));
    }

    #[test]
    fn standard_chromosome_filter() {
        for chrom in ["1", "22", "chrX", "Y", "MT", "chrM"] {
            assert!(is_standard_chromosome(chrom), "{chrom} should be standard");
        }
        for chrom in ["0", "23", "chrUn_gl000220", "chr1_KI270706v1_random", "HLA-A"] {
            assert!(!is_standard_chromosome(chrom), "{chrom} should not be standard");
        }
    }

    #[test]
    fn canonical_id_uses_ref_then_alt() {
        // allele1 is ALT, allele2 is REF in the fileset convention.
        let v = record("1", "rs1", 100, "G", "A");
        assert_eq!(v.canonical_id(), "chr1_100_A_G");
    }

    #[test]
    fn first_occurrence_wins_and_later_duplicates_are_dropped() {
        let variants = vec![
            record("chr1", "rs1", 100, "G", "A"),
            record("1", "rs9", 100, "G", "A"),
            record("chr2", "rs2", 200, "T", "C"),
        ];
        let map = canonicalize(&variants);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("rs1"), Some("chr1_100_A_G"));
        assert_eq!(map.get("rs9"), None);
        assert_eq!(map.get("rs2"), Some("chr2_200_C_T"));
    }

    #[test]
    fn assignment_is_permutation_invariant_apart_from_the_first_duplicate() {
        let forward = vec![
            record("1", "rs1", 100, "G", "A"),
            record("2", "rs2", 200, "T", "C"),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();

        let map_fwd = canonicalize(&forward);
        let map_rev = canonicalize(&reversed);
        assert_eq!(map_fwd.get("rs1"), map_rev.get("rs1"));
        assert_eq!(map_fwd.get("rs2"), map_rev.get("rs2"));
    }
}
