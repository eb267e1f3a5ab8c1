/*! The contracts of the collaborators the quantification engine drives, and the
errors they may raise */
use mzpeaks::Tolerance;
use thiserror::Error;

use crate::evidence::MsnEvidence;
use crate::identification::Identification;
use crate::params::ClassThresholds;
use crate::probe::IsotopeProbes;
use crate::query::{AnalyteKey, AnalyteQuery};

/// An error raised by the chromatogram engine while detecting or splitting peaks
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeakCalculationError {
    #[error("Peak calculation failed: {0}")]
    Failed(String),
    #[error("The peak at m/z {mz} and {rt} min is too small to be valid")]
    TooSmall { mz: f64, rt: f64 },
    #[error("No signal was found for m/z {mz}")]
    NoSignal { mz: f64 },
}

/// An error raised when the fragmentation rules of an analyte class cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleLookupError {
    #[error("No fragmentation rule is defined for {class} [{modification}]")]
    NoRuleDefined {
        class: String,
        modification: String,
    },
    #[error("The fragmentation rule for {class} [{modification}] is invalid: {reason}")]
    InvalidRule {
        class: String,
        modification: String,
        reason: String,
    },
}

/// An error that aborts the quantification of one analyte definition
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuantificationError {
    #[error("Failed to calculate peaks for {key}: {source}")]
    PeakCalculation {
        key: AnalyteKey,
        #[source]
        source: PeakCalculationError,
    },
    #[error("The analyte definition {0} is not in the catalog")]
    UnknownAnalyte(AnalyteKey),
}

/// The parameters of a request for the isotopic probes of one analyte
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub mz: f64,
    pub charge: i32,
    pub mz_tolerance: Tolerance,
    /// The expected retention time, if any
    pub rt_hint: Option<f64>,
    /// How far before and after `rt_hint` to search, in minutes
    pub rt_tolerance: (f64, f64),
    pub isotope_probabilities: Vec<f64>,
    pub negative_isotopes: bool,
    pub ms_level: u8,
    /// The MS1 area a region must reach to be reported with
    /// [`ProbeStatus::Ok`](crate::probe::ProbeStatus::Ok)
    pub area_cutoff: f64,
}

impl ProbeRequest {
    pub fn for_query(query: &AnalyteQuery, rt_tolerance: (f64, f64), area_cutoff: f64) -> Self {
        let (rt_hint, rt_tolerance) = match query.retention_time {
            Some(window) => (Some(window.time), (window.before, window.after)),
            None => (None, rt_tolerance),
        };
        Self {
            mz: query.mz,
            charge: query.charge,
            mz_tolerance: query.mz_tolerance,
            rt_hint,
            rt_tolerance,
            isotope_probabilities: query.isotope_probabilities.clone(),
            negative_isotopes: query.negative_isotopes,
            ms_level: 1,
            area_cutoff,
        }
    }
}

/// A request to re-split one shared chromatographic region into one sub-peak per
/// contributing analyte.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitRequest {
    pub mz: f64,
    pub charge: i32,
    pub lower_valley: f64,
    pub upper_valley: f64,
    /// The retention time each sub-peak is expected to be centered at, ordered
    /// the same way as the requested partners
    pub positions: Vec<f64>,
    /// The inner and outer search borders around each position, in minutes
    pub borders: Vec<(f64, f64)>,
}

/// The peak detection engine that extracts chromatographic regions from MS1 data
pub trait ChromatogramEngine {
    /// Find every chromatographic hit for the requested m/z, returning the probes of
    /// each hit keyed by isotope number.
    fn detect_isotopic_probes(
        &mut self,
        request: &ProbeRequest,
    ) -> Result<Vec<IsotopeProbes>, PeakCalculationError>;

    /// Split a shared region into sub-peaks, one per entry of [`SplitRequest::positions`]
    fn split_shared_peak(
        &mut self,
        request: &SplitRequest,
    ) -> Result<Vec<IsotopeProbes>, PeakCalculationError>;

    /// The retention times of MSn scans whose precursor covers `mz` between
    /// `lower` and `upper`
    fn msn_scan_times(&self, mz: f64, lower: f64, upper: f64) -> Vec<f64>;
}

/// How strictly the rule evaluator should judge an identification
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Judge the identification in the presence of possible isobars
    #[default]
    Standard,
    /// Judge the identification as the only species in its peak, discarding it when
    /// the evidence is insufficient
    StrictSingleSpecies,
}

/// The outcome of evaluating the fragmentation rules of an identification
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Evidence(MsnEvidence),
    /// The identification should be discarded. If `track` is set, the hit should be
    /// kept in the removed hits table for later re-evaluation.
    Discard { track: bool },
}

/// The MSn fragmentation rule evaluator, which owns the cached MSn spectra
pub trait RuleEvaluator {
    fn evaluate(
        &mut self,
        query: &AnalyteQuery,
        identification: &Identification,
        mode: EvaluationMode,
    ) -> Result<Evaluation, RuleLookupError>;

    /// The thresholds the rules of a class and modification override
    fn class_thresholds(
        &self,
        class: &str,
        modification: &str,
    ) -> Result<ClassThresholds, RuleLookupError>;
}

impl<T: ChromatogramEngine + ?Sized> ChromatogramEngine for &mut T {
    fn detect_isotopic_probes(
        &mut self,
        request: &ProbeRequest,
    ) -> Result<Vec<IsotopeProbes>, PeakCalculationError> {
        (**self).detect_isotopic_probes(request)
    }

    fn split_shared_peak(
        &mut self,
        request: &SplitRequest,
    ) -> Result<Vec<IsotopeProbes>, PeakCalculationError> {
        (**self).split_shared_peak(request)
    }

    fn msn_scan_times(&self, mz: f64, lower: f64, upper: f64) -> Vec<f64> {
        (**self).msn_scan_times(mz, lower, upper)
    }
}

impl<T: RuleEvaluator + ?Sized> RuleEvaluator for &mut T {
    fn evaluate(
        &mut self,
        query: &AnalyteQuery,
        identification: &Identification,
        mode: EvaluationMode,
    ) -> Result<Evaluation, RuleLookupError> {
        (**self).evaluate(query, identification, mode)
    }

    fn class_thresholds(
        &self,
        class: &str,
        modification: &str,
    ) -> Result<ClassThresholds, RuleLookupError> {
        (**self).class_thresholds(class, modification)
    }
}
