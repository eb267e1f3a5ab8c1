#![allow(dead_code)]
use std::collections::HashMap;

use lipidquant::params::ClassThresholds;
use lipidquant::traits::{ProbeRequest, SplitRequest};
use lipidquant::{
    AnalyteKey, AnalyteQuery, ChromatogramEngine, Confidence, Evaluation, EvaluationMode,
    Fragment, Identification, IsotopeProbes, MsnEvidence, PeakCalculationError, ProbeSet,
    RuleEvaluator, RuleLookupError,
};

pub const PC_MZ: f64 = 760.5851;
pub const PE_MZ: f64 = 760.5880;

pub fn region(mz: f64, lower: f64, peak: f64, upper: f64, area: f64) -> IsotopeProbes {
    let mut probes = IsotopeProbes::new();
    probes.insert(0, vec![ProbeSet::new(mz, 0, lower, peak, upper, area)]);
    probes
}

/// A chromatogram engine serving canned regions per m/z
#[derive(Debug, Default)]
pub struct FakeEngine {
    pub hits: Vec<(f64, Vec<IsotopeProbes>)>,
    pub failing: Vec<f64>,
    pub scans: Vec<f64>,
    pub split_areas: Vec<f64>,
    pub requests: Vec<ProbeRequest>,
    pub split_requests: Vec<SplitRequest>,
}

impl FakeEngine {
    /// Add a region of `area` centered on `rt`, 0.2 minutes wide
    pub fn with_hit(mut self, mz: f64, rt: f64, area: f64) -> Self {
        let probes = region(mz, rt - 0.1, rt, rt + 0.1, area);
        match self.hits.iter_mut().find(|(m, _)| (*m - mz).abs() < 1e-6) {
            Some((_, found)) => found.push(probes),
            None => self.hits.push((mz, vec![probes])),
        }
        self
    }

    pub fn failing_on(mut self, mz: f64) -> Self {
        self.failing.push(mz);
        self
    }

    pub fn with_scans(mut self, scans: Vec<f64>, split_areas: Vec<f64>) -> Self {
        self.scans = scans;
        self.split_areas = split_areas;
        self
    }
}

impl ChromatogramEngine for FakeEngine {
    fn detect_isotopic_probes(
        &mut self,
        request: &ProbeRequest,
    ) -> Result<Vec<IsotopeProbes>, PeakCalculationError> {
        self.requests.push(request.clone());
        if self.failing.iter().any(|m| (*m - request.mz).abs() < 1e-6) {
            return Err(PeakCalculationError::NoSignal { mz: request.mz });
        }
        Ok(self
            .hits
            .iter()
            .find(|(m, _)| (*m - request.mz).abs() < 1e-6)
            .map(|(_, found)| found.clone())
            .unwrap_or_default())
    }

    fn split_shared_peak(
        &mut self,
        request: &SplitRequest,
    ) -> Result<Vec<IsotopeProbes>, PeakCalculationError> {
        self.split_requests.push(request.clone());
        Ok(request
            .positions
            .iter()
            .zip(self.split_areas.iter())
            .map(|(pos, area)| region(request.mz, pos - 0.03, *pos, pos + 0.03, *area))
            .collect())
    }

    fn msn_scan_times(&self, _mz: f64, lower: f64, upper: f64) -> Vec<f64> {
        self.scans
            .iter()
            .copied()
            .filter(|t| lower <= *t && *t <= upper)
            .collect()
    }
}

/// A rule evaluator answering from tables keyed by analyte and retention time key
#[derive(Debug, Default)]
pub struct FakeEvaluator {
    pub evidence: HashMap<(AnalyteKey, String), MsnEvidence>,
    pub discard: HashMap<(AnalyteKey, String), bool>,
    pub strict: HashMap<(AnalyteKey, String), Evaluation>,
    pub thresholds: HashMap<String, ClassThresholds>,
    pub strict_calls: usize,
}

impl FakeEvaluator {
    pub fn with_evidence(mut self, key: usize, rt_key: &str, evidence: MsnEvidence) -> Self {
        self.evidence
            .insert((AnalyteKey(key), rt_key.to_string()), evidence);
        self
    }

    pub fn with_strict(mut self, key: usize, rt_key: &str, evaluation: Evaluation) -> Self {
        self.strict
            .insert((AnalyteKey(key), rt_key.to_string()), evaluation);
        self
    }

    pub fn with_discard(mut self, key: usize, rt_key: &str, track: bool) -> Self {
        self.discard
            .insert((AnalyteKey(key), rt_key.to_string()), track);
        self
    }
}

impl RuleEvaluator for FakeEvaluator {
    fn evaluate(
        &mut self,
        query: &AnalyteQuery,
        identification: &Identification,
        mode: EvaluationMode,
    ) -> Result<Evaluation, RuleLookupError> {
        let key = (query.key, identification.rt_key().unwrap_or_default());
        match mode {
            EvaluationMode::Standard => {
                if let Some(track) = self.discard.get(&key) {
                    return Ok(Evaluation::Discard { track: *track });
                }
                self.evidence
                    .get(&key)
                    .cloned()
                    .map(Evaluation::Evidence)
                    .ok_or_else(|| RuleLookupError::NoRuleDefined {
                        class: query.class.clone(),
                        modification: query.modification.clone(),
                    })
            }
            EvaluationMode::StrictSingleSpecies => {
                self.strict_calls += 1;
                Ok(self.strict.get(&key).cloned().unwrap_or_else(|| {
                    Evaluation::Evidence(identification.evidence.clone().unwrap_or_default())
                }))
            }
        }
    }

    fn class_thresholds(
        &self,
        class: &str,
        modification: &str,
    ) -> Result<ClassThresholds, RuleLookupError> {
        self.thresholds
            .get(class)
            .cloned()
            .ok_or_else(|| RuleLookupError::NoRuleDefined {
                class: class.to_string(),
                modification: modification.to_string(),
            })
    }
}

/// Head group level evidence holding `(name, intensity, time)` fragments, with a base
/// peak of 1000 and a total intensity of 2000
pub fn head_group_evidence(fragments: &[(&str, f64, f64)]) -> MsnEvidence {
    let mut evidence = MsnEvidence::new(Confidence::HeadGroupDetected, 1000.0, 2000.0);
    for (name, intensity, time) in fragments {
        evidence.add_head_group_fragment(Fragment::new(*name, 100.0, *intensity, *time));
    }
    evidence
}

pub fn pc_query() -> AnalyteQuery {
    AnalyteQuery::new(1, "PC", "34:1", "H", PC_MZ, 1).with_isobars([2])
}

pub fn pe_query() -> AnalyteQuery {
    AnalyteQuery::new(2, "PE", "37:1", "H", PE_MZ, 1).with_isobars([1])
}
