// ==============================================================================
// codec/stats.rs - Variant Genotype Statistics
// ==============================================================================
// Description: Allele and genotype counts computed from sample GT fields
// Author: Matt Barham
// Created: 2026-10-02
// Modified: 2026-10-02
// Version: 1.0.0
// ==============================================================================

use std::collections::BTreeMap;

use crate::models::{SampleTable, VariantStats};

/// Statistics over every sample carrying a `GT` field; `None` if none do
pub fn compute_stats(samples: &SampleTable) -> Option<VariantStats> {
    let mut stats = VariantStats::default();
    let mut called_genotypes = 0u32;
    let mut seen = false;

    for fields in samples.values() {
        let genotype = match fields.get("GT") {
            Some(gt) => gt,
            None => continue,
        };
        seen = true;

        let mut missing = false;
        for allele in genotype.split(['/', '|']) {
            match allele {
                "." | "" => {
                    stats.missing_alleles += 1;
                    missing = true;
                }
                "0" => stats.ref_allele_count += 1,
                _ => stats.alt_allele_count += 1,
            }
        }

        if missing {
            stats.missing_genotypes += 1;
        } else {
            called_genotypes += 1;
            *stats.genotype_counts.entry(genotype.clone()).or_insert(0) += 1;
        }
    }

    if !seen {
        return None;
    }

    let alleles = stats.ref_allele_count + stats.alt_allele_count;
    if alleles > 0 {
        let minor = stats.ref_allele_count.min(stats.alt_allele_count);
        stats.maf = f64::from(minor) / f64::from(alleles);
    }

    if called_genotypes > 0 {
        if let Some((genotype, count)) = least_frequent(&stats.genotype_counts) {
            stats.mgf = f64::from(count) / f64::from(called_genotypes);
            stats.mgf_genotype = Some(genotype);
        }
    }

    Some(stats)
}

/// First genotype (in key order) with the lowest count
fn least_frequent(counts: &BTreeMap<String, u32>) -> Option<(String, u32)> {
    let mut best: Option<(&String, u32)> = None;
    for (genotype, &count) in counts {
        if best.map_or(true, |(_, c)| count < c) {
            best = Some((genotype, count));
        }
    }
    best.map(|(g, c)| (g.clone(), c))
}
