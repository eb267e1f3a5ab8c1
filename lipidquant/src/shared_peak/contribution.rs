use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::evidence::MsnEvidence;
use crate::identification::Identification;
use crate::query::AnalyteKey;

/// One analyte's claim on a [`SharedPeak`](super::SharedPeak)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub analyte: AnalyteKey,
    pub identification: Identification,
    /// Fragments found in this partner's evidence that no other current partner reports
    pub distinct: BTreeSet<String>,
    /// Fragments this partner reports together with at least one other partner
    pub shared: BTreeSet<String>,
}

impl Contribution {
    pub fn new(identification: Identification) -> Self {
        Self {
            analyte: identification.analyte,
            identification,
            distinct: BTreeSet::new(),
            shared: BTreeSet::new(),
        }
    }

    pub fn evidence(&self) -> Option<&MsnEvidence> {
        self.identification.evidence.as_ref()
    }

    pub fn has_msn(&self) -> bool {
        self.identification.has_msn()
    }

    pub fn fragment_names(&self) -> BTreeSet<&str> {
        self.evidence()
            .map(|e| e.fragment_names())
            .unwrap_or_default()
    }

    /// The summed intensity of the fragments distinct to this partner
    pub fn distinct_intensity(&self) -> f64 {
        self.intensity_of(self.distinct.iter().map(|s| s.as_str()))
    }

    /// The summed intensity of the distinct fragments that reach `floor`
    pub fn distinct_intensity_above(&self, floor: f64) -> f64 {
        self.valid_distinct(floor)
            .into_iter()
            .filter_map(|name| self.evidence().and_then(|e| e.get_fragment(name)))
            .map(|f| f.intensity)
            .sum()
    }

    /// The distinct fragments that reach `floor`
    pub fn valid_distinct(&self, floor: f64) -> Vec<&str> {
        let Some(evidence) = self.evidence() else {
            return Vec::new();
        };
        self.distinct
            .iter()
            .filter(|name| {
                evidence
                    .get_fragment(name)
                    .map(|f| f.intensity >= floor)
                    .unwrap_or(false)
            })
            .map(|s| s.as_str())
            .collect()
    }

    fn intensity_of<'a, I: Iterator<Item = &'a str>>(&self, names: I) -> f64 {
        match self.evidence() {
            Some(evidence) => names
                .filter_map(|name| evidence.get_fragment(name))
                .map(|f| f.intensity)
                .sum(),
            None => 0.0,
        }
    }

    /// The intensity-weighted mean retention time of the distinct fragments, or the
    /// retention time of the identification when there is nothing to weigh
    pub fn distinct_position(&self) -> Option<f64> {
        if let Some(evidence) = self.evidence() {
            let (weighted, total) = self
                .distinct
                .iter()
                .filter_map(|name| evidence.get_fragment(name))
                .fold((0.0, 0.0), |(weighted, total), f| {
                    (weighted + f.time * f.intensity, total + f.intensity)
                });
            if total > 0.0 {
                return Some(weighted / total);
            }
        }
        self.identification.rt
    }

    pub fn label(&self) -> String {
        self.identification.label()
    }
}
