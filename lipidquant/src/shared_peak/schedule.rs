use std::collections::{BTreeSet, VecDeque};

use tracing::trace;

use crate::query::AnalyteKey;

use super::SharedPeak;

#[derive(Debug, Clone)]
struct ScheduledPeak {
    rt: f64,
    partners: usize,
    analytes: BTreeSet<AnalyteKey>,
}

/// The order in which unresolved shared peaks go through the far retention time
/// exclusion.
///
/// Peaks are visited by ascending retention time. A peak waits while another
/// pending peak holds one of its analytes with fewer partners, since settling that
/// peak first may produce the unique hit the exclusion is measured against.
#[derive(Debug, Clone, Default)]
pub struct DisentangleSchedule {
    peaks: Vec<ScheduledPeak>,
    pending: VecDeque<usize>,
}

impl DisentangleSchedule {
    /// Schedule the peaks at `indices` of `peaks`
    pub fn new(peaks: &[SharedPeak], indices: impl IntoIterator<Item = usize>) -> Self {
        let peaks_: Vec<ScheduledPeak> = peaks
            .iter()
            .map(|p| ScheduledPeak {
                rt: p.rt,
                partners: p.len(),
                analytes: p.analytes(),
            })
            .collect();
        let mut pending: Vec<usize> = indices
            .into_iter()
            .filter(|i| *i < peaks_.len())
            .collect();
        pending.sort_by(|a, b| peaks_[*a].rt.total_cmp(&peaks_[*b].rt).then(a.cmp(b)));
        pending.dedup();
        Self {
            peaks: peaks_,
            pending: pending.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn waits_on(&self, index: usize, other: usize) -> bool {
        let (this, that) = (&self.peaks[index], &self.peaks[other]);
        that.partners < this.partners && !this.analytes.is_disjoint(&that.analytes)
    }

    fn is_ready(&self, index: usize) -> bool {
        !self
            .pending
            .iter()
            .any(|other| *other != index && self.waits_on(index, *other))
    }

    /// The index of the next peak to process, removing it from the schedule
    pub fn next_peak(&mut self) -> Option<usize> {
        // The pending peak with the fewest partners never waits on another
        let position = self
            .pending
            .iter()
            .position(|index| self.is_ready(*index))
            .unwrap_or(0);
        for index in self.pending.iter().take(position) {
            trace!(
                "Deferring shared peak at {:.2} until its neighbors are settled",
                self.peaks[*index].rt
            );
        }
        self.pending.remove(position)
    }
}

impl Iterator for DisentangleSchedule {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_peak()
    }
}
