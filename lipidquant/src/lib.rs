//! Disambiguation of isobaric lipid identifications in LC-MS data.
//!
//! Several analyte definitions whose theoretical m/z are close enough can be
//! detected as the same chromatographic peak. This crate decides how much of such a
//! shared peak belongs to each definition using MSn fragment evidence, and merges
//! nearby detections of one definition that are really one identification.
//!
//! The peak detection engine and the MSn rule evaluator are collaborators supplied
//! through the [`ChromatogramEngine`](crate::traits::ChromatogramEngine) and
//! [`RuleEvaluator`](crate::traits::RuleEvaluator) traits. The main entry points are
//! [`QuantificationEngine`] and the single-shot [`quantify`].
pub mod evidence;
pub mod identification;
pub mod msn;
pub mod params;
pub mod probe;
pub mod query;
pub mod shared_peak;
pub mod traits;
pub mod union;

pub mod api;

pub use crate::api::{quantify, QuantResult, QuantificationEngine};
pub use crate::evidence::{Confidence, Fragment, MsnEvidence};
pub use crate::identification::{Identification, IdentificationBuilder};
pub use crate::params::{ConfigError, QuantParams};
pub use crate::probe::{IsotopeProbes, ProbeSet, ProbeStatus};
pub use crate::query::{AnalyteKey, AnalyteQuery, QueryCatalog, RetentionWindow};
pub use crate::traits::{
    ChromatogramEngine, Evaluation, EvaluationMode, PeakCalculationError, QuantificationError,
    RuleEvaluator, RuleLookupError,
};
