//! Configuration of the quantification engine and the rule thresholds it consumes
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::{AnalyteKey, AnalyteMap};

/// The environment variable prefix configuration is read from
pub const ENV_PREFIX: &str = "LIPIDQUANT_";

/// An error raised while loading or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Figment(
        #[source]
        #[from]
        Box<figment::Error>,
    ),
    #[error("The threshold {name} has an invalid value {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        Self::Figment(Box::new(value))
    }
}

/// In which order MS1 and MSn evidence decide whether a hit is reported
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsIdentificationOrder {
    /// Every MS1 hit is reported, MSn evidence only refines it
    #[default]
    Ms1First,
    /// MS1-only hits are dropped for analytes that have at least one MSn-confirmed hit
    MsnFirst,
    /// Only MSn-confirmed hits are reported
    MsnOnly,
}

/// Global defaults for every tunable of a quantification pass.
///
/// All times are in minutes, all ratios are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantParams {
    /// The fraction of the MSn base peak a fragment must reach to count
    pub base_peak_cutoff: f64,
    /// The fraction of the MSn spectrum intensity the evidence must explain
    pub min_spectrum_coverage: f64,
    /// Below this contribution relative to the strongest partner, a partner of a
    /// shared peak is dropped
    pub isobar_exclusion_ratio: f64,
    /// Below this contribution relative to the strongest partner, a partner of a
    /// shared peak that lies far from its other hits is dropped
    pub isobar_far_exclusion_ratio: f64,
    /// How far a shared peak must be from the other hits of an analyte for the far
    /// exclusion to apply
    pub isobar_other_rt_difference: f64,
    /// The time window within which hits of one analyte may be merged
    pub union_time: f64,
    pub ignore_positional_evidence: bool,
    pub identification_order: MsIdentificationOrder,
    /// The MS1 area a region must reach to be quantified
    pub base_peak_area_cutoff: f64,
    /// The tolerance within which two peak apexes or borders are the same
    pub tie_tolerance: f64,
    /// The inner and outer fractions of a shared region's width used as borders
    /// when re-splitting it
    pub split_border_fractions: (f64, f64),
    pub mz_tolerance_ppm: f64,
    /// How far before and after the expected time to search when a definition has
    /// a retention time but no tolerance of its own
    pub rt_tolerance: (f64, f64),
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            base_peak_cutoff: 0.05,
            min_spectrum_coverage: 0.1,
            isobar_exclusion_ratio: 0.01,
            isobar_far_exclusion_ratio: 0.1,
            isobar_other_rt_difference: 1.0,
            union_time: 0.5,
            ignore_positional_evidence: false,
            identification_order: MsIdentificationOrder::Ms1First,
            base_peak_area_cutoff: 0.0,
            tie_tolerance: 0.01,
            split_border_fractions: (0.05, 0.10),
            mz_tolerance_ppm: 10.0,
            rt_tolerance: (0.5, 0.5),
        }
    }
}

impl QuantParams {
    /// Layer the defaults, a TOML file if one is given, and `LIPIDQUANT_`
    /// environment variables, then validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Figment::from(Serialized::defaults(QuantParams::default()));
        if let Some(path) = path {
            config = config.merge(Toml::file_exact(path));
        }
        config = config.merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(config)
    }

    pub fn from_figment(config: Figment) -> Result<Self, ConfigError> {
        let params: QuantParams = config.extract()?;
        params.validate()?;
        Ok(params)
    }

    /// The m/z tolerance analyte definitions are searched with unless they carry
    /// their own
    pub fn mz_tolerance(&self) -> Tolerance {
        Tolerance::PPM(self.mz_tolerance_ppm)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratios = [
            ("base_peak_cutoff", self.base_peak_cutoff),
            ("min_spectrum_coverage", self.min_spectrum_coverage),
            ("isobar_exclusion_ratio", self.isobar_exclusion_ratio),
            ("isobar_far_exclusion_ratio", self.isobar_far_exclusion_ratio),
            ("split_border_fractions.0", self.split_border_fractions.0),
            ("split_border_fractions.1", self.split_border_fractions.1),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        let non_negative = [
            ("isobar_other_rt_difference", self.isobar_other_rt_difference),
            ("union_time", self.union_time),
            ("base_peak_area_cutoff", self.base_peak_area_cutoff),
            ("tie_tolerance", self.tie_tolerance),
            ("mz_tolerance_ppm", self.mz_tolerance_ppm),
            ("rt_tolerance.0", self.rt_tolerance.0),
            ("rt_tolerance.1", self.rt_tolerance.1),
        ];
        for (name, value) in non_negative {
            if value.is_nan() || value < 0.0 {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        if self.split_border_fractions.0 > self.split_border_fractions.1 {
            return Err(ConfigError::InvalidThreshold {
                name: "split_border_fractions",
                value: self.split_border_fractions.0,
            });
        }
        Ok(())
    }
}

/// The thresholds the fragmentation rules of one class and modification override.
/// Unset fields fall back to [`QuantParams`].
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassThresholds {
    pub base_peak_cutoff: Option<f64>,
    pub min_spectrum_coverage: Option<f64>,
    pub isobar_exclusion_ratio: Option<f64>,
    pub isobar_far_exclusion_ratio: Option<f64>,
    pub isobar_other_rt_difference: Option<f64>,
    pub union_time: Option<f64>,
    pub ignore_positional_evidence: Option<bool>,
    pub identification_order: Option<MsIdentificationOrder>,
    /// A class-specific MS1 area cutoff, which only applies when it is tighter than
    /// the global one
    pub ms1_area_cutoff: Option<f64>,
}

/// The concrete thresholds in effect for one class and modification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleThresholds {
    pub base_peak_cutoff: f64,
    pub min_spectrum_coverage: f64,
    pub isobar_exclusion_ratio: f64,
    pub isobar_far_exclusion_ratio: f64,
    pub isobar_other_rt_difference: f64,
    pub union_time: f64,
    pub ignore_positional_evidence: bool,
    pub identification_order: MsIdentificationOrder,
    pub ms1_area_cutoff: Option<f64>,
}

impl RuleThresholds {
    pub fn resolve(params: &QuantParams, class: Option<&ClassThresholds>) -> Self {
        let base = Self::from(params);
        match class {
            Some(class) => Self {
                base_peak_cutoff: class.base_peak_cutoff.unwrap_or(base.base_peak_cutoff),
                min_spectrum_coverage: class
                    .min_spectrum_coverage
                    .unwrap_or(base.min_spectrum_coverage),
                isobar_exclusion_ratio: class
                    .isobar_exclusion_ratio
                    .unwrap_or(base.isobar_exclusion_ratio),
                isobar_far_exclusion_ratio: class
                    .isobar_far_exclusion_ratio
                    .unwrap_or(base.isobar_far_exclusion_ratio),
                isobar_other_rt_difference: class
                    .isobar_other_rt_difference
                    .unwrap_or(base.isobar_other_rt_difference),
                union_time: class.union_time.unwrap_or(base.union_time),
                ignore_positional_evidence: class
                    .ignore_positional_evidence
                    .unwrap_or(base.ignore_positional_evidence),
                identification_order: class
                    .identification_order
                    .unwrap_or(base.identification_order),
                ms1_area_cutoff: class.ms1_area_cutoff,
            },
            None => base,
        }
    }
}

impl From<&QuantParams> for RuleThresholds {
    fn from(params: &QuantParams) -> Self {
        Self {
            base_peak_cutoff: params.base_peak_cutoff,
            min_spectrum_coverage: params.min_spectrum_coverage,
            isobar_exclusion_ratio: params.isobar_exclusion_ratio,
            isobar_far_exclusion_ratio: params.isobar_far_exclusion_ratio,
            isobar_other_rt_difference: params.isobar_other_rt_difference,
            union_time: params.union_time,
            ignore_positional_evidence: params.ignore_positional_evidence,
            identification_order: params.identification_order,
            ms1_area_cutoff: None,
        }
    }
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self::from(&QuantParams::default())
    }
}

/// The thresholds in effect for each analyte definition of a pass
#[derive(Debug, Clone, Default)]
pub struct ThresholdTable {
    default: RuleThresholds,
    by_analyte: AnalyteMap<RuleThresholds>,
}

impl ThresholdTable {
    pub fn new(default: RuleThresholds) -> Self {
        Self {
            default,
            by_analyte: AnalyteMap::default(),
        }
    }

    pub fn insert(&mut self, key: AnalyteKey, thresholds: RuleThresholds) {
        self.by_analyte.insert(key, thresholds);
    }

    /// The thresholds of `key`, or the global thresholds if it has none of its own
    pub fn get(&self, key: &AnalyteKey) -> &RuleThresholds {
        self.by_analyte.get(key).unwrap_or(&self.default)
    }
}

/// The MS1 area cutoff shared with the chromatogram engine, which a class may
/// tighten for the duration of its quantification pass.
#[derive(Debug, Clone)]
pub struct AreaCutoff {
    default: f64,
    current: Arc<AtomicU64>,
}

impl AreaCutoff {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            current: Arc::new(AtomicU64::new(default.to_bits())),
        }
    }

    pub fn default_value(&self) -> f64 {
        self.default
    }

    pub fn current(&self) -> f64 {
        f64::from_bits(self.current.load(Ordering::Acquire))
    }

    /// Replace the cutoff until the returned guard is dropped
    pub fn override_with(&self, value: f64) -> AreaCutoffGuard {
        let previous = f64::from_bits(self.current.swap(value.to_bits(), Ordering::AcqRel));
        tracing::debug!("Overriding MS1 area cutoff {previous} with {value}");
        AreaCutoffGuard {
            cutoff: self.clone(),
            previous,
        }
    }

    /// Tighten the cutoff to `value` if it is above the current one, otherwise
    /// leave it as it is.
    pub fn tighten(&self, value: Option<f64>) -> Option<AreaCutoffGuard> {
        match value {
            Some(value) if value > self.current() => Some(self.override_with(value)),
            _ => None,
        }
    }
}

/// Restores the [`AreaCutoff`] it was created from when dropped
#[derive(Debug)]
#[must_use]
pub struct AreaCutoffGuard {
    cutoff: AreaCutoff,
    previous: f64,
}

impl Drop for AreaCutoffGuard {
    fn drop(&mut self) {
        self.cutoff
            .current
            .store(self.previous.to_bits(), Ordering::Release);
        tracing::debug!("Restored MS1 area cutoff {}", self.previous);
    }
}
