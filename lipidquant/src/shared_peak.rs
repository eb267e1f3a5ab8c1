/*! Chromatographic peaks claimed by more than one analyte definition, and the
machinery to decide which of the claims are justified by MSn evidence. */
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::query::AnalyteKey;

mod contribution;
mod detector;
mod disentangle;
mod schedule;

pub use contribution::Contribution;
pub use detector::SharedPeakDetector;
pub use disentangle::{
    coverage_gate, distinct_fragment_gate, far_rt_gate, minor_contribution_gate,
    percental_shares, Disentangler, DisentangledPeak, SplitOutcome,
};
pub use schedule::DisentangleSchedule;

/// Where a shared peak is in the disentangling process
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakState {
    #[default]
    Detected,
    /// A single partner remains
    Resolved,
    /// Every partner was removed
    Unclaimed,
    /// The region was re-split into one chromatographic peak per partner
    SplitPhysically,
    /// The area was divided among the partners by their distinct fragment intensity
    SplitPercentally,
}

impl PeakState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Detected)
    }
}

/// Why a partner was removed from a shared peak
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RemovalReason {
    NoDistinctFragments,
    InsufficientCoverage { coverage: f64 },
    MinorContribution { ratio: f64 },
    FarFromOtherHits { ratio: f64, distance: f64 },
    StrictEvaluationFailed,
}

impl Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDistinctFragments => write!(f, "no distinct fragments"),
            Self::InsufficientCoverage { coverage } => {
                write!(f, "spectrum coverage {coverage:.3} without shared fragments")
            }
            Self::MinorContribution { ratio } => write!(f, "minor contribution {ratio:.3}"),
            Self::FarFromOtherHits { ratio, distance } => write!(
                f,
                "contribution {ratio:.3} at {distance:.2} min from its other hits"
            ),
            Self::StrictEvaluationFailed => write!(f, "failed strict single species evaluation"),
        }
    }
}

/// A partner removed from a shared peak
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub contribution: Contribution,
    pub reason: RemovalReason,
}

impl Removal {
    pub fn new(contribution: Contribution, reason: RemovalReason) -> Self {
        Self {
            contribution,
            reason,
        }
    }
}

/// One physical MS1 event claimed by several analyte definitions
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SharedPeak {
    pub contributions: Vec<Contribution>,
    /// The retention time all contributions share
    pub rt: f64,
    pub state: PeakState,
}

impl SharedPeak {
    pub fn new(contributions: Vec<Contribution>, rt: f64) -> Self {
        let mut peak = Self {
            contributions,
            rt,
            state: PeakState::Detected,
        };
        peak.assign_fragment_sets();
        peak
    }

    pub fn len(&self) -> usize {
        self.contributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Contribution> {
        self.contributions.iter()
    }

    pub fn analytes(&self) -> BTreeSet<AnalyteKey> {
        self.contributions.iter().map(|c| c.analyte).collect()
    }

    pub fn contains_analyte(&self, key: &AnalyteKey) -> bool {
        self.contributions.iter().any(|c| c.analyte == *key)
    }

    pub fn has_msn(&self) -> bool {
        self.contributions.iter().any(|c| c.has_msn())
    }

    /// The earliest lower valley and latest upper valley over all partners
    pub fn time_range(&self) -> Option<(f64, f64)> {
        self.contributions
            .iter()
            .filter_map(|c| c.identification.time_range())
            .reduce(|(a0, a1), (b0, b1)| (a0.min(b0), a1.max(b1)))
    }

    /// Recompute which fragments are distinct to each partner and which are shared,
    /// relative to the current set of partners.
    pub fn assign_fragment_sets(&mut self) {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for c in self.contributions.iter() {
            for name in c.fragment_names() {
                *counts.entry(name.to_string()).or_default() += 1;
            }
        }
        for c in self.contributions.iter_mut() {
            let names: Vec<String> = c.fragment_names().into_iter().map(String::from).collect();
            c.distinct.clear();
            c.shared.clear();
            for name in names {
                if counts.get(&name).copied().unwrap_or_default() > 1 {
                    c.shared.insert(name);
                } else {
                    c.distinct.insert(name);
                }
            }
        }
    }

    /// Remove the partners at `indices`, then re-derive the fragment sets of the rest
    pub(crate) fn remove_at(
        &mut self,
        indices: &[usize],
        reasons: &[RemovalReason],
    ) -> Vec<Removal> {
        let mut removed = Vec::with_capacity(indices.len());
        let mut order: Vec<(usize, RemovalReason)> =
            indices.iter().copied().zip(reasons.iter().copied()).collect();
        order.sort_by(|a, b| b.0.cmp(&a.0));
        for (i, reason) in order {
            let c = self.contributions.remove(i);
            tracing::debug!("Removing {} from shared peak at {:.2}: {reason}", c.label(), self.rt);
            removed.push(Removal::new(c, reason));
        }
        removed.reverse();
        self.assign_fragment_sets();
        removed
    }

    /// Set the terminal state implied by the number of remaining partners, if any
    pub(crate) fn settle_if_decided(&mut self) {
        match self.contributions.len() {
            0 => self.state = PeakState::Unclaimed,
            1 => self.state = PeakState::Resolved,
            _ => {}
        }
    }
}

impl IntoIterator for SharedPeak {
    type Item = Contribution;

    type IntoIter = <std::vec::Vec<Contribution> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.contributions.into_iter()
    }
}
