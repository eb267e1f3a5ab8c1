/*! Chromatographic peak regions reported by the peak detection engine */
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whether a detected region is large enough to be quantified
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeStatus {
    #[default]
    Ok,
    TooSmall,
}

/// One detected chromatographic region for one isotope of a target m/z.
///
/// All retention times are in minutes. A well-formed probe satisfies
/// `lower_valley <= peak <= upper_valley`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSet {
    /// The m/z center of the extracted band
    pub mz: f64,
    /// The lower edge of the extracted m/z band
    pub lower_mz: f64,
    /// The upper edge of the extracted m/z band
    pub upper_mz: f64,
    /// The isotope this region was extracted for, negative for negative isotope series
    pub isotope: i32,
    pub lower_valley: f64,
    /// The retention time of the peak apex
    pub peak: f64,
    pub upper_valley: f64,
    pub area: f64,
    pub area_error: f64,
    pub background: f64,
    pub status: ProbeStatus,
}

impl ProbeSet {
    pub fn new(
        mz: f64,
        isotope: i32,
        lower_valley: f64,
        peak: f64,
        upper_valley: f64,
        area: f64,
    ) -> Self {
        Self {
            mz,
            lower_mz: mz,
            upper_mz: mz,
            isotope,
            lower_valley,
            peak,
            upper_valley,
            area,
            area_error: 0.0,
            background: 0.0,
            status: ProbeStatus::Ok,
        }
    }

    pub fn with_mz_band(mut self, lower_mz: f64, upper_mz: f64) -> Self {
        self.lower_mz = lower_mz;
        self.upper_mz = upper_mz;
        self
    }

    pub fn with_status(mut self, status: ProbeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_area_error(mut self, area_error: f64, background: f64) -> Self {
        self.area_error = area_error;
        self.background = background;
        self
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self.status, ProbeStatus::Ok)
    }

    /// Whether the apex lies within the valleys of the region
    pub fn is_well_formed(&self) -> bool {
        self.lower_valley <= self.peak && self.peak <= self.upper_valley
    }

    pub fn width(&self) -> f64 {
        self.upper_valley - self.lower_valley
    }

    pub fn contains_time(&self, time: f64) -> bool {
        self.lower_valley <= time && time <= self.upper_valley
    }

    /// Test whether two regions describe the same chromatographic event, either
    /// because their apexes coincide or because both of their borders do, within
    /// `tolerance` minutes.
    pub fn coincides_with(&self, other: &ProbeSet, tolerance: f64) -> bool {
        if (self.peak - other.peak).abs() <= tolerance {
            return true;
        }
        (self.lower_valley - other.lower_valley).abs() <= tolerance
            && (self.upper_valley - other.upper_valley).abs() <= tolerance
    }

    /// Whether two regions are the same region extracted twice, used to avoid
    /// double counting when the probes of several hits are pooled.
    pub(crate) fn same_region(&self, other: &ProbeSet) -> bool {
        const EPS: f64 = 1e-9;
        self.isotope == other.isotope
            && (self.peak - other.peak).abs() < EPS
            && (self.lower_valley - other.lower_valley).abs() < EPS
            && (self.upper_valley - other.upper_valley).abs() < EPS
            && (self.mz - other.mz).abs() < EPS
    }
}

/// The probes of a single chromatographic hit, keyed by isotope number.
pub type IsotopeProbes = BTreeMap<i32, Vec<ProbeSet>>;
