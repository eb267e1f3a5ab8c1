/*! Merging nearby hits of one analyte definition that are one identification */
use std::collections::BTreeSet;

use itertools::Itertools;
use tracing::{debug, trace};

use crate::evidence::Confidence;
use crate::identification::{insert_hit, sorted_hits, HitMap, Identification};
use crate::msn::{Attachment, EvidenceAttacher};
use crate::params::RuleThresholds;
use crate::query::AnalyteQuery;
use crate::traits::{EvaluationMode, RuleEvaluator};

/// A set of hits of one analyte that will be reported as one identification
#[derive(Debug, Clone, PartialEq)]
pub struct UnionGroup {
    /// Indices of the member hits, in retention time order
    pub members: Vec<usize>,
    /// The earliest and latest member retention time
    pub rt_span: (f64, f64),
    /// The earliest lower valley and latest upper valley of the members
    pub range: (f64, f64),
    /// The retention times a member may not reach because a group with conflicting
    /// evidence lies beyond them
    pub limits: (f64, f64),
    pub confidence: Confidence,
    /// Whether the group may take part in merges at all
    pub mergeable: bool,
}

impl UnionGroup {
    fn new(index: usize, hit: &Identification, mergeable: bool) -> Self {
        let rt = hit.rt.unwrap_or_default();
        Self {
            members: vec![index],
            rt_span: (rt, rt),
            range: hit.time_range().unwrap_or((rt, rt)),
            limits: (f64::NEG_INFINITY, f64::INFINITY),
            confidence: hit.confidence(),
            mergeable,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The species every member with evidence at `level` supports
    pub fn signature<'h>(
        &self,
        hits: &'h [Identification],
        level: Confidence,
    ) -> BTreeSet<&'h str> {
        self.members
            .iter()
            .filter_map(|i| hits[*i].evidence.as_ref())
            .map(|e| e.signature(level))
            .filter(|s| !s.is_empty())
            .reduce(|a, b| a.intersection(&b).copied().collect())
            .unwrap_or_default()
    }

    fn encloses(&self, rt_span: (f64, f64)) -> bool {
        self.range.0 <= rt_span.0 && rt_span.1 <= self.range.1
    }

    fn admits(&self, rt_span: (f64, f64)) -> bool {
        self.limits.0 < rt_span.0 && rt_span.1 < self.limits.1
    }

    /// The distance from `rt` to the nearest member, zero inside the span
    fn distance_to(&self, rt: f64) -> f64 {
        if rt < self.rt_span.0 {
            self.rt_span.0 - rt
        } else if rt > self.rt_span.1 {
            rt - self.rt_span.1
        } else {
            0.0
        }
    }

    fn absorb(&mut self, other: UnionGroup) {
        self.members.extend(other.members);
        self.members.sort_unstable();
        self.rt_span = (
            self.rt_span.0.min(other.rt_span.0),
            self.rt_span.1.max(other.rt_span.1),
        );
        self.range = (
            self.range.0.min(other.range.0),
            self.range.1.max(other.range.1),
        );
        self.limits = (
            self.limits.0.max(other.limits.0),
            self.limits.1.min(other.limits.1),
        );
        self.confidence = self.confidence.max(other.confidence);
    }

    /// The member whose retention time is closest to the centre of the span, the
    /// earlier member on ties
    pub fn representative(&self, hits: &[Identification]) -> usize {
        let centre = (self.rt_span.0 + self.rt_span.1) / 2.0;
        let mut best = self.members[0];
        let mut best_distance = f64::INFINITY;
        for i in self.members.iter().copied() {
            let distance = (hits[i].rt.unwrap_or_default() - centre).abs();
            if distance < best_distance {
                best = i;
                best_distance = distance;
            }
        }
        best
    }
}

/// The levels whose evidence names species that can contradict each other
const SPECIES_LEVELS: [Confidence; 2] = [
    Confidence::PositionDetected,
    Confidence::FragmentsDetected,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Merge,
    Conflict,
    Apart,
}

/// Merges the hits of one analyte definition within a time window whose MSn
/// evidence does not contradict itself, from the most to the least specific
/// evidence level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvidenceUnionMerger {
    pub union_time: f64,
    pub ignore_positional_evidence: bool,
}

impl From<&RuleThresholds> for EvidenceUnionMerger {
    fn from(value: &RuleThresholds) -> Self {
        Self::new(value.union_time, value.ignore_positional_evidence)
    }
}

impl EvidenceUnionMerger {
    pub fn new(union_time: f64, ignore_positional_evidence: bool) -> Self {
        Self {
            union_time,
            ignore_positional_evidence,
        }
    }

    fn compare(
        &self,
        left: &UnionGroup,
        right: &UnionGroup,
        hits: &[Identification],
        level: Confidence,
    ) -> Verdict {
        let merged_span = (
            left.rt_span.0.min(right.rt_span.0),
            left.rt_span.1.max(right.rt_span.1),
        );
        let within = merged_span.1 - merged_span.0 <= self.union_time;
        let encloses = left.encloses(right.rt_span) || right.encloses(left.rt_span);
        if !(within || encloses) {
            return Verdict::Apart;
        }
        // Species must never contradict, whichever level is being merged
        let conflict = SPECIES_LEVELS.iter().any(|lv| {
            let a = left.signature(hits, *lv);
            let b = right.signature(hits, *lv);
            !a.is_empty() && !b.is_empty() && a.is_disjoint(&b)
        });
        let agree = level == Confidence::HeadGroupDetected
            || !left
                .signature(hits, level)
                .is_disjoint(&right.signature(hits, level));
        if conflict {
            return Verdict::Conflict;
        }
        if !(left.admits(merged_span) && right.admits(merged_span)) {
            return Verdict::Apart;
        }
        if (within && agree) || encloses {
            Verdict::Merge
        } else {
            Verdict::Apart
        }
    }

    fn merge_level(
        &self,
        groups: &mut Vec<UnionGroup>,
        hits: &[Identification],
        level: Confidence,
    ) {
        let mut k = 0;
        loop {
            let eligible: Vec<usize> = groups
                .iter()
                .positions(|g| g.mergeable && g.confidence >= level)
                .collect();
            if k + 1 >= eligible.len() {
                break;
            }
            let (a, b) = (eligible[k], eligible[k + 1]);
            match self.compare(&groups[a], &groups[b], hits, level) {
                Verdict::Merge => {
                    trace!(
                        "Merging hits at {:.2} and {:.2} at level {level}",
                        groups[a].rt_span.0,
                        groups[b].rt_span.0
                    );
                    let right = groups.remove(b);
                    groups[a].absorb(right);
                }
                Verdict::Conflict => {
                    trace!(
                        "Hits at {:.2} and {:.2} conflict at level {level}",
                        groups[a].rt_span.1,
                        groups[b].rt_span.0
                    );
                    let boundary = (groups[a].rt_span.1, groups[b].rt_span.0);
                    groups[a].limits.1 = groups[a].limits.1.min(boundary.1);
                    groups[b].limits.0 = groups[b].limits.0.max(boundary.0);
                    k += 1;
                }
                Verdict::Apart => {
                    k += 1;
                }
            }
        }
    }

    /// Decide which of `hits`, sorted by retention time, belong together.
    ///
    /// Hits without MSn evidence join the closest group that encloses them or lies
    /// within the union time once all levels are merged. Hits whose area was split
    /// by share stay on their own.
    pub fn plan(&self, hits: &[Identification]) -> Vec<UnionGroup> {
        let mut groups: Vec<UnionGroup> = Vec::new();
        let mut unconfirmed: Vec<usize> = Vec::new();
        for (i, hit) in hits.iter().enumerate() {
            if hit.percental_split.is_some() {
                groups.push(UnionGroup::new(i, hit, false));
            } else if hit.has_msn() {
                groups.push(UnionGroup::new(i, hit, true));
            } else {
                unconfirmed.push(i);
            }
        }

        for level in Confidence::DESCENDING {
            self.merge_level(&mut groups, hits, level);
        }

        for i in unconfirmed {
            let rt = hits[i].rt.unwrap_or_default();
            let closest = groups
                .iter()
                .enumerate()
                .filter(|(_, g)| g.mergeable && g.confidence.has_msn())
                .filter(|(_, g)| g.admits((rt, rt)))
                .filter(|(_, g)| g.encloses((rt, rt)) || g.distance_to(rt) <= self.union_time)
                .fold(None, |best: Option<(usize, f64)>, (j, g)| {
                    let d = g.distance_to(rt);
                    match best {
                        Some((_, bd)) if bd <= d => best,
                        _ => Some((j, d)),
                    }
                });
            match closest {
                Some((j, _)) => {
                    let group = &mut groups[j];
                    group.members.push(i);
                    group.members.sort_unstable();
                    group.rt_span = (group.rt_span.0.min(rt), group.rt_span.1.max(rt));
                    if let Some((lo, hi)) = hits[i].time_range() {
                        group.range = (group.range.0.min(lo), group.range.1.max(hi));
                    }
                }
                None => groups.push(UnionGroup::new(i, &hits[i], true)),
            }
        }
        groups.sort_by(|a, b| a.rt_span.0.total_cmp(&b.rt_span.0));
        groups
    }

    /// Merge the hits of `query` and re-evaluate the evidence of every merged hit.
    ///
    /// A merged hit the rules discard is left out. If the rules want it tracked it
    /// goes into `removed`.
    #[tracing::instrument(skip_all, level = "debug", fields(analyte = %query.key))]
    pub fn merge<R: RuleEvaluator>(
        &self,
        hits: HitMap,
        query: &AnalyteQuery,
        attacher: &mut EvidenceAttacher<R>,
        removed: &mut HitMap,
    ) -> HitMap {
        let ordered: Vec<Identification> = sorted_hits(&hits)
            .into_iter()
            .map(|(_, hit)| hit.clone())
            .collect();
        let groups = self.plan(&ordered);
        let mut merged = HitMap::with_capacity(groups.len());
        for group in groups {
            if group.len() == 1 {
                insert_hit(&mut merged, ordered[group.members[0]].clone());
                continue;
            }
            match self.combine(&group, &ordered, query, attacher) {
                Attachment::Attached(hit) => {
                    insert_hit(&mut merged, hit);
                }
                Attachment::Discarded {
                    identification,
                    track: true,
                } => {
                    insert_hit(removed, identification);
                }
                Attachment::Discarded { identification, .. } => {
                    debug!("Dropping merged hit {}", identification.label());
                }
            }
        }
        merged
    }

    fn combine<R: RuleEvaluator>(
        &self,
        group: &UnionGroup,
        hits: &[Identification],
        query: &AnalyteQuery,
        attacher: &mut EvidenceAttacher<R>,
    ) -> Attachment {
        let representative = group.representative(hits);
        let mut combined = hits[representative].clone();
        for i in group.members.iter().copied() {
            if i != representative {
                combined.absorb_probes(&hits[i]);
            }
        }
        combined.area = group.members.iter().map(|i| hits[*i].area).sum();
        combined.rt = hits[representative].rt;

        let best_evidence = group
            .members
            .iter()
            .map(|i| &hits[*i])
            .fold(None, |best: Option<&Identification>, hit| match best {
                Some(b) if b.confidence() >= hit.confidence() => best,
                _ => Some(hit),
            })
            .and_then(|hit| hit.evidence.clone());
        combined.evidence = best_evidence.clone();

        let attachment = attacher.attach(
            query,
            combined,
            EvaluationMode::Standard,
            self.ignore_positional_evidence,
        );
        let mut combined = match attachment {
            Attachment::Attached(identification) => identification,
            Attachment::Discarded { .. } => {
                debug!(
                    "The rules discard the union of {} hits of {}",
                    group.len(),
                    query.label()
                );
                return attachment;
            }
        };
        if !combined.has_msn() {
            combined.evidence = best_evidence;
        }
        debug!(
            "Merged {} hits of {} into {} with area {:.1}",
            group.len(),
            query.label(),
            combined.label(),
            combined.area
        );
        Attachment::Attached(combined)
    }
}
