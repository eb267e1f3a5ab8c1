/*! Analyte hits assembled from isotopic probes */
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::evidence::{Confidence, MsnEvidence};
use crate::probe::{IsotopeProbes, ProbeSet};
use crate::query::{AnalyteKey, AnalyteMap, AnalyteQuery};

/// The hits of one analyte definition keyed by [`Identification::rt_key`]
pub type HitMap = HashMap<String, Identification>;

/// The hits of several analyte definitions
pub type AnalyteHits = AnalyteMap<HitMap>;

/// The hits of `hits` ordered by retention time
pub fn sorted_hits(hits: &HitMap) -> Vec<(&String, &Identification)> {
    let mut acc: Vec<_> = hits.iter().collect();
    acc.sort_by(|a, b| {
        a.1.rt
            .unwrap_or_default()
            .total_cmp(&b.1.rt.unwrap_or_default())
            .then_with(|| a.0.cmp(b.0))
    });
    acc
}

/// Store `identification` under its retention time key. When another hit already
/// holds the key, the one with the larger area is kept. Hits without a retention
/// time are not stored.
pub fn insert_hit(hits: &mut HitMap, identification: Identification) -> bool {
    let Some(key) = identification.rt_key() else {
        return false;
    };
    match hits.get(&key) {
        Some(existing) if existing.area >= identification.area => {
            tracing::debug!(
                "Keeping {} over the smaller hit {} with the same retention time",
                existing.label(),
                identification.label()
            );
            false
        }
        _ => {
            hits.insert(key, identification);
            true
        }
    }
}

/// Round a retention time to two decimals
#[inline]
pub fn round_time(time: f64) -> f64 {
    (time * 100.0).round() / 100.0
}

/// Render a retention time the way hits are keyed, with two decimals
#[inline]
pub fn time_key(time: f64) -> String {
    format!("{:.2}", time)
}

/// An analyte hit: the analyte definition it was searched for, the chromatographic
/// regions detected for each isotope, and the MSn evidence found for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub analyte: AnalyteKey,
    pub class: String,
    pub analyte_name: String,
    pub analyte_formula: String,
    pub modification: String,
    pub modification_formula: String,
    /// The theoretical m/z of the monoisotopic ion
    pub mz: f64,
    pub charge: i32,
    /// The detected regions, indexed by the magnitude of the isotope number
    pub isotopes: Vec<Vec<ProbeSet>>,
    /// The retention time of the monoisotopic peak in minutes
    pub rt: Option<f64>,
    /// The summed area of the monoisotopic regions
    pub area: f64,
    pub evidence: Option<MsnEvidence>,
    /// The percentage of `area` attributed to this hit when the peak it was
    /// detected in is shared with isobaric analytes
    pub percental_split: Option<f64>,
    /// The identification this one was derived from by splitting a shared peak
    pub origin: Option<Box<Identification>>,
}

impl Identification {
    pub fn new(query: &AnalyteQuery) -> Self {
        Self {
            analyte: query.key,
            class: query.class.clone(),
            analyte_name: query.analyte.clone(),
            analyte_formula: query.analyte_formula.clone(),
            modification: query.modification.clone(),
            modification_formula: query.modification_formula.clone(),
            mz: query.mz,
            charge: query.charge,
            isotopes: Vec::new(),
            rt: None,
            area: 0.0,
            evidence: None,
            percental_split: None,
            origin: None,
        }
    }

    pub fn label(&self) -> String {
        match self.rt {
            Some(rt) => format!(
                "{} {} [{}] @ {}",
                self.class,
                self.analyte_name,
                self.modification,
                time_key(rt)
            ),
            None => format!("{} {} [{}]", self.class, self.analyte_name, self.modification),
        }
    }

    /// The key hits are stored under, the retention time with two decimals
    pub fn rt_key(&self) -> Option<String> {
        self.rt.map(time_key)
    }

    pub fn confidence(&self) -> Confidence {
        self.evidence
            .as_ref()
            .map(|e| e.confidence)
            .unwrap_or_default()
    }

    pub fn has_msn(&self) -> bool {
        self.confidence().has_msn()
    }

    pub fn monoisotopic(&self) -> &[ProbeSet] {
        self.isotopes.first().map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn isotope(&self, isotope: i32) -> &[ProbeSet] {
        self.isotopes
            .get(isotope.unsigned_abs() as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn num_isotopes(&self) -> usize {
        self.isotopes.len()
    }

    /// The earliest lower valley and latest upper valley of the monoisotopic regions
    pub fn time_range(&self) -> Option<(f64, f64)> {
        let probes = self.monoisotopic();
        if probes.is_empty() {
            return None;
        }
        let start = probes
            .iter()
            .map(|p| p.lower_valley)
            .fold(f64::INFINITY, f64::min);
        let end = probes
            .iter()
            .map(|p| p.upper_valley)
            .fold(f64::NEG_INFINITY, f64::max);
        Some((start, end))
    }

    /// Whether any monoisotopic region of this hit coincides with one of `other`
    pub fn coincides_with(&self, other: &Identification, tolerance: f64) -> bool {
        self.monoisotopic().iter().any(|a| {
            other
                .monoisotopic()
                .iter()
                .any(|b| a.coincides_with(b, tolerance))
        })
    }

    /// The area attributed to this analyte after a percental split
    pub fn quantified_area(&self) -> f64 {
        match self.percental_split {
            Some(share) => self.area * share / 100.0,
            None => self.area,
        }
    }

    pub fn with_evidence(mut self, evidence: MsnEvidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    /// Create a copy of this hit which receives `share` percent of the shared area,
    /// remembering the unsplit hit it came from.
    pub fn percentally_split(&self, share: f64) -> Identification {
        let mut split = self.clone();
        split.percental_split = Some(share);
        split.origin = Some(Box::new(self.clone()));
        split
    }

    /// Recompute the retention time and area from the monoisotopic regions.
    ///
    /// The retention time is the mean apex of all monoisotopic regions, rounded
    /// to two decimals, and the area is the sum over the regions that are large
    /// enough to quantify.
    pub fn recompute(&mut self) {
        let probes = self.monoisotopic();
        if probes.is_empty() {
            self.rt = None;
            self.area = 0.0;
            return;
        }
        let mean_apex = probes.iter().map(|p| p.peak).sum::<f64>() / probes.len() as f64;
        let area = probes.iter().filter(|p| p.is_ok()).map(|p| p.area).sum();
        self.rt = Some(round_time(mean_apex));
        self.area = area;
    }

    pub(crate) fn push_probe(&mut self, probe: ProbeSet) {
        let index = probe.isotope.unsigned_abs() as usize;
        if self.isotopes.len() <= index {
            self.isotopes.resize(index + 1, Vec::new());
        }
        self.isotopes[index].push(probe);
    }

    /// Add the regions of `other` that this hit does not already hold
    pub(crate) fn absorb_probes(&mut self, other: &Identification) {
        for probes in other.isotopes.iter() {
            for probe in probes {
                let index = probe.isotope.unsigned_abs() as usize;
                let known = self
                    .isotopes
                    .get(index)
                    .map(|v| v.iter().any(|p| p.same_region(probe)))
                    .unwrap_or(false);
                if !known {
                    self.push_probe(probe.clone());
                }
            }
        }
    }
}

/// Turns the probes detected for one chromatographic hit into an [`Identification`]
#[derive(Debug, Clone, Copy)]
pub struct IdentificationBuilder<'a> {
    query: &'a AnalyteQuery,
}

impl<'a> IdentificationBuilder<'a> {
    pub fn new(query: &'a AnalyteQuery) -> Self {
        Self { query }
    }

    /// Build an identification from a map of isotope number to regions.
    ///
    /// For negative isotope series each probe's isotope number is negated before
    /// it is stored. No MSn evidence is attached.
    pub fn build(&self, probes: &IsotopeProbes) -> Identification {
        let mut ident = Identification::new(self.query);
        for (isotope, regions) in probes.iter() {
            let magnitude = isotope.unsigned_abs() as i32;
            let isotope = if self.query.negative_isotopes {
                -magnitude
            } else {
                magnitude
            };
            for probe in regions {
                let mut probe = probe.clone();
                probe.isotope = isotope;
                if !probe.is_well_formed() {
                    tracing::warn!(
                        "Probe for {} isotope {isotope} has its apex {} outside of {}-{}",
                        self.query.label(),
                        probe.peak,
                        probe.lower_valley,
                        probe.upper_valley
                    );
                }
                ident.push_probe(probe);
            }
        }
        ident.recompute();
        ident
    }
}
