use itertools::Itertools;
use tracing::{debug, trace, warn};

use crate::identification::{Identification, IdentificationBuilder};
use crate::msn::{Attachment, EvidenceAttacher};
use crate::params::{QuantParams, ThresholdTable};
use crate::query::{AnalyteMap, QueryCatalog};
use crate::traits::{ChromatogramEngine, EvaluationMode, RuleEvaluator, SplitRequest};

use super::{Contribution, DisentangleSchedule, PeakState, Removal, RemovalReason, SharedPeak};

/// Remove every partner that has no fragment of its own.
///
/// Applying this gate to a peak in which every partner already has a distinct
/// fragment changes nothing.
pub fn distinct_fragment_gate(mut peak: SharedPeak) -> (SharedPeak, Vec<Removal>) {
    if peak.len() < 2 {
        return (peak, Vec::new());
    }
    let indices: Vec<usize> = peak.iter().positions(|c| c.distinct.is_empty()).collect();
    let reasons = vec![RemovalReason::NoDistinctFragments; indices.len()];
    let removed = peak.remove_at(&indices, &reasons);
    (peak, removed)
}

/// The fraction of a partner's MSn spectrum explained by its own distinct fragments
/// that pass its base peak cutoff, or `None` if none of them pass.
fn spectrum_coverage(contribution: &Contribution, table: &ThresholdTable) -> Option<f64> {
    let evidence = contribution.evidence()?;
    let floor = evidence.intensity_floor(table.get(&contribution.analyte).base_peak_cutoff);
    if contribution.valid_distinct(floor).is_empty() {
        return None;
    }
    if evidence.total_intensity <= 0.0 {
        return Some(0.0);
    }
    Some(contribution.distinct_intensity_above(floor) / evidence.total_intensity)
}

/// Repeatedly remove the partner with the lowest spectrum coverage that fails its
/// minimum coverage, re-deriving the distinct fragments after each removal, until
/// every partner passes or one partner is left.
pub fn coverage_gate(mut peak: SharedPeak, table: &ThresholdTable) -> (SharedPeak, Vec<Removal>) {
    let mut removed = Vec::new();
    while peak.len() > 1 {
        let failing = (0..peak.len())
            .filter_map(|i| {
                let c = &peak.contributions[i];
                let threshold = table.get(&c.analyte).min_spectrum_coverage;
                match spectrum_coverage(c, table) {
                    Some(coverage) if coverage >= threshold => None,
                    Some(coverage) => Some((i, coverage)),
                    None => Some((i, 0.0)),
                }
            })
            .reduce(|best, next| if next.1 < best.1 { next } else { best });
        let Some((i, coverage)) = failing else {
            break;
        };
        removed.extend(peak.remove_at(&[i], &[RemovalReason::InsufficientCoverage { coverage }]));
    }
    (peak, removed)
}

fn distinct_sums(peak: &SharedPeak) -> Vec<f64> {
    peak.iter().map(|c| c.distinct_intensity()).collect()
}

/// The first partner with the largest distinct fragment intensity
fn strongest(sums: &[f64]) -> Option<usize> {
    sums.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
            Some((_, b)) if b >= *v => best,
            _ => Some((i, *v)),
        })
        .map(|(i, _)| i)
}

/// The distinct fragment intensity of partner `index` relative to all others
fn contribution_ratio(sums: &[f64], index: usize) -> f64 {
    let rest: f64 = sums
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != index)
        .map(|(_, v)| *v)
        .sum();
    if rest > 0.0 {
        sums[index] / rest
    } else {
        f64::INFINITY
    }
}

/// Remove, all at once, every partner whose distinct fragment intensity relative to
/// the other partners falls below its exclusion ratio. The strongest partner is
/// never removed.
pub fn minor_contribution_gate(
    mut peak: SharedPeak,
    table: &ThresholdTable,
) -> (SharedPeak, Vec<Removal>) {
    if peak.len() < 2 {
        return (peak, Vec::new());
    }
    let sums = distinct_sums(&peak);
    let Some(best) = strongest(&sums) else {
        return (peak, Vec::new());
    };
    if sums[best] <= 0.0 {
        return (peak, Vec::new());
    }
    let mut indices = Vec::new();
    let mut reasons = Vec::new();
    for (i, c) in peak.iter().enumerate() {
        if i == best {
            continue;
        }
        let ratio = contribution_ratio(&sums, i);
        if ratio < table.get(&c.analyte).isobar_exclusion_ratio {
            indices.push(i);
            reasons.push(RemovalReason::MinorContribution { ratio });
        }
    }
    let removed = peak.remove_at(&indices, &reasons);
    (peak, removed)
}

/// The distance from `rt` to the nearest of `references`, if they all lie strictly
/// on the same side of it
fn one_sided_distance(rt: f64, references: &[f64]) -> Option<f64> {
    if references.is_empty() {
        None
    } else if references.iter().all(|r| *r < rt) {
        references.iter().map(|r| rt - r).reduce(f64::min)
    } else if references.iter().all(|r| *r > rt) {
        references.iter().map(|r| r - rt).reduce(f64::min)
    } else {
        None
    }
}

/// Remove partners that look like accidental isobaric hits of an analyte whose
/// unique MSn-confirmed hits all lie on one side of this peak.
///
/// A partner is removed when its contribution ratio is below its far exclusion
/// ratio and the nearest of its analyte's `references` is at least the configured
/// distance away. Partners are considered weakest first, one removal at a time,
/// and the strongest partner is never removed.
pub fn far_rt_gate(
    mut peak: SharedPeak,
    references: &AnalyteMap<Vec<f64>>,
    table: &ThresholdTable,
) -> (SharedPeak, Vec<Removal>) {
    let mut removed = Vec::new();
    while peak.len() > 1 {
        let sums = distinct_sums(&peak);
        let Some(best) = strongest(&sums) else {
            break;
        };
        let found = (0..peak.len())
            .filter(|i| *i != best)
            .sorted_by(|a, b| sums[*a].total_cmp(&sums[*b]).then(a.cmp(b)))
            .find_map(|i| {
                let c = &peak.contributions[i];
                let thresholds = table.get(&c.analyte);
                let distance = one_sided_distance(peak.rt, references.get(&c.analyte)?)?;
                let ratio = contribution_ratio(&sums, i);
                trace!(
                    "{} contributes {ratio:.3} at {distance:.2} min from its other hits",
                    c.label()
                );
                (ratio < thresholds.isobar_far_exclusion_ratio
                    && distance >= thresholds.isobar_other_rt_difference)
                    .then_some((i, ratio, distance))
            });
        let Some((i, ratio, distance)) = found else {
            break;
        };
        removed.extend(
            peak.remove_at(&[i], &[RemovalReason::FarFromOtherHits { ratio, distance }]),
        );
    }
    (peak, removed)
}

/// The percentage of a shared area each partner receives given the summed
/// intensities of their distinct fragments. Without any distinct intensity the
/// area is divided equally.
pub fn percental_shares(sums: &[f64]) -> Vec<f64> {
    let total: f64 = sums.iter().sum();
    if total > 0.0 {
        sums.iter().map(|v| 100.0 * v / total).collect()
    } else {
        vec![100.0 / sums.len() as f64; sums.len()]
    }
}

/// How the area of a shared peak with several surviving partners was divided
#[derive(Debug, Clone, PartialEq)]
pub enum SplitOutcome {
    /// The region was re-split into one chromatographic peak per partner
    Physical(Vec<Identification>),
    /// Each partner received a share of the unsplit area
    Percental(Vec<Identification>),
}

/// The outcome of disentangling one [`SharedPeak`]
#[derive(Debug, Clone, PartialEq)]
pub struct DisentangledPeak {
    pub rt: f64,
    pub state: PeakState,
    /// The identifications each remaining analyte keeps, after any split
    pub survivors: Vec<Identification>,
    pub removed: Vec<Removal>,
    /// The identifications as they were before their area was split
    pub pre_split: Vec<Identification>,
}

/// Reduces shared peaks to the partners their MSn evidence justifies, and divides
/// the area of those that remain ambiguous.
#[derive(Debug)]
pub struct Disentangler<'a, E: ChromatogramEngine, R: RuleEvaluator> {
    engine: &'a mut E,
    attacher: &'a mut EvidenceAttacher<R>,
    catalog: &'a QueryCatalog,
    thresholds: &'a ThresholdTable,
    params: &'a QuantParams,
}

impl<'a, E: ChromatogramEngine, R: RuleEvaluator> Disentangler<'a, E, R> {
    pub fn new(
        engine: &'a mut E,
        attacher: &'a mut EvidenceAttacher<R>,
        catalog: &'a QueryCatalog,
        thresholds: &'a ThresholdTable,
        params: &'a QuantParams,
    ) -> Self {
        Self {
            engine,
            attacher,
            catalog,
            thresholds,
            params,
        }
    }

    /// Disentangle every peak in `peaks`.
    ///
    /// `references` holds, per analyte, the retention times of the hits confirmed by
    /// MSn evidence that were not shared. Peaks resolved to a single partner add to
    /// it before the far retention time exclusion runs.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn disentangle(
        &mut self,
        peaks: Vec<SharedPeak>,
        mut references: AnalyteMap<Vec<f64>>,
    ) -> Vec<DisentangledPeak> {
        let mut removed: Vec<Vec<Removal>> = Vec::with_capacity(peaks.len());
        let mut reduced: Vec<SharedPeak> = Vec::with_capacity(peaks.len());
        for peak in peaks {
            let (peak, dropped) = self.reduce(peak);
            if let [single] = peak.contributions.as_slice() {
                add_reference(&mut references, single);
            }
            reduced.push(peak);
            removed.push(dropped);
        }

        let unresolved: Vec<usize> = reduced.iter().positions(|p| p.len() > 1).collect();
        for index in DisentangleSchedule::new(&reduced, unresolved) {
            let peak = std::mem::take(&mut reduced[index]);
            let before = peak.len();
            let step = far_rt_gate(peak, &references, self.thresholds);
            let peak = self.settle_step(before, step, &mut removed[index]);
            if let [single] = peak.contributions.as_slice() {
                add_reference(&mut references, single);
            }
            reduced[index] = peak;
        }

        reduced
            .into_iter()
            .zip(removed)
            .map(|(peak, removed)| self.finish(peak, removed))
            .collect()
    }

    /// Run the distinct fragment, coverage and minor contribution gates on `peak`
    pub fn reduce(&mut self, peak: SharedPeak) -> (SharedPeak, Vec<Removal>) {
        let mut removed = Vec::new();
        trace!("Reducing shared peak at {:.2} with {} partners", peak.rt, peak.len());

        let before = peak.len();
        let step = distinct_fragment_gate(peak);
        let peak = self.settle_step(before, step, &mut removed);

        let before = peak.len();
        let step = coverage_gate(peak, self.thresholds);
        let peak = self.settle_step(before, step, &mut removed);

        let before = peak.len();
        let step = minor_contribution_gate(peak, self.thresholds);
        let peak = self.settle_step(before, step, &mut removed);

        (peak, removed)
    }

    fn settle_step(
        &mut self,
        before: usize,
        (mut peak, dropped): (SharedPeak, Vec<Removal>),
        removed: &mut Vec<Removal>,
    ) -> SharedPeak {
        removed.extend(dropped);
        if before > 1 && peak.len() == 1 {
            self.strict_reevaluation(&mut peak, removed);
        }
        peak.settle_if_decided();
        peak
    }

    /// Re-evaluate the sole remaining partner as if it were the only species in the
    /// peak, removing it if its rules discard it.
    fn strict_reevaluation(&mut self, peak: &mut SharedPeak, removed: &mut Vec<Removal>) {
        let Some(survivor) = peak.contributions.first() else {
            return;
        };
        let Some(query) = self.catalog.get(&survivor.analyte) else {
            warn!(
                "{} is not in the catalog, skipping its strict re-evaluation",
                survivor.analyte
            );
            return;
        };
        let ignore_positional = self
            .thresholds
            .get(&survivor.analyte)
            .ignore_positional_evidence;
        match self.attacher.attach(
            query,
            survivor.identification.clone(),
            EvaluationMode::StrictSingleSpecies,
            ignore_positional,
        ) {
            Attachment::Attached(identification) => {
                debug!(
                    "{} is the sole survivor of the peak at {:.2} with {}",
                    identification.label(),
                    peak.rt,
                    identification.confidence()
                );
                peak.contributions[0].identification = identification;
                peak.assign_fragment_sets();
            }
            Attachment::Discarded { .. } => {
                removed.extend(peak.remove_at(&[0], &[RemovalReason::StrictEvaluationFailed]));
            }
        }
    }

    fn finish(&mut self, peak: SharedPeak, removed: Vec<Removal>) -> DisentangledPeak {
        let rt = peak.rt;
        match peak.len() {
            0 => DisentangledPeak {
                rt,
                state: PeakState::Unclaimed,
                survivors: Vec::new(),
                removed,
                pre_split: Vec::new(),
            },
            1 => DisentangledPeak {
                rt,
                state: PeakState::Resolved,
                survivors: peak.into_iter().map(|c| c.identification).collect(),
                removed,
                pre_split: Vec::new(),
            },
            _ => {
                let pre_split = peak.iter().map(|c| c.identification.clone()).collect();
                let (state, survivors) = match self.split(&peak) {
                    SplitOutcome::Physical(parts) => (PeakState::SplitPhysically, parts),
                    SplitOutcome::Percental(parts) => (PeakState::SplitPercentally, parts),
                };
                DisentangledPeak {
                    rt,
                    state,
                    survivors,
                    removed,
                    pre_split,
                }
            }
        }
    }

    /// Divide the area of a peak that still has several partners, re-splitting the
    /// region when two partners remain and it was sampled by more than one MSn scan
    pub fn split(&mut self, peak: &SharedPeak) -> SplitOutcome {
        if peak.len() == 2 {
            if let Some(parts) = self.split_physically(peak) {
                return SplitOutcome::Physical(parts);
            }
        }
        debug!(
            "Splitting the area of the peak at {:.2} among {} partners",
            peak.rt,
            peak.len()
        );
        let shares = percental_shares(&distinct_sums(peak));
        SplitOutcome::Percental(
            peak.iter()
                .zip(shares)
                .map(|(c, share)| c.identification.percentally_split(share))
                .collect(),
        )
    }

    fn split_physically(&mut self, peak: &SharedPeak) -> Option<Vec<Identification>> {
        let (lower, upper) = peak.time_range()?;
        let first = peak.contributions.first()?;
        let mz = first.identification.mz;
        let scans = self.engine.msn_scan_times(mz, lower, upper);
        if scans.len() < 2 {
            trace!(
                "The peak at {:.2} was sampled by {} MSn scans, not re-splitting it",
                peak.rt,
                scans.len()
            );
            return None;
        }
        let width = upper - lower;
        let (inner, outer) = self.params.split_border_fractions;
        let request = SplitRequest {
            mz,
            charge: first.identification.charge,
            lower_valley: lower,
            upper_valley: upper,
            positions: peak
                .iter()
                .map(|c| c.distinct_position().unwrap_or(peak.rt))
                .collect(),
            borders: vec![(inner * width, outer * width); peak.len()],
        };
        let parts = match self.engine.split_shared_peak(&request) {
            Ok(parts) => parts,
            Err(err) => {
                debug!("Failed to re-split the peak at {:.2}: {err}", peak.rt);
                return None;
            }
        };
        if parts.len() != peak.len() {
            debug!(
                "Re-splitting the peak at {:.2} produced {} regions for {} partners",
                peak.rt,
                parts.len(),
                peak.len()
            );
            return None;
        }
        let mut split = Vec::with_capacity(parts.len());
        for (c, probes) in peak.iter().zip(parts.iter()) {
            let Some(query) = self.catalog.get(&c.analyte) else {
                warn!("{} is not in the catalog, cannot re-split for it", c.analyte);
                return None;
            };
            let mut identification = IdentificationBuilder::new(query).build(probes);
            if identification.area <= 0.0 {
                debug!(
                    "Re-splitting the peak at {:.2} left no area for {}",
                    peak.rt,
                    c.label()
                );
                return None;
            }
            identification.evidence = c.identification.evidence.clone();
            identification.origin = Some(Box::new(c.identification.clone()));
            split.push(identification);
        }
        debug!("Re-split the peak at {:.2} into {} peaks", peak.rt, split.len());
        Some(split)
    }
}

fn add_reference(references: &mut AnalyteMap<Vec<f64>>, contribution: &Contribution) {
    if !contribution.has_msn() {
        return;
    }
    if let Some(rt) = contribution.identification.rt {
        references.entry(contribution.analyte).or_default().push(rt);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::evidence::{Confidence, MsnEvidence};
    use crate::msn::test::TableEvaluator;
    use crate::params::RuleThresholds;
    use crate::probe::{IsotopeProbes, ProbeSet};
    use crate::query::AnalyteKey;
    use crate::shared_peak::test::{make_contribution, make_query};
    use crate::traits::{Evaluation, PeakCalculationError, ProbeRequest};

    #[derive(Debug, Default)]
    struct SplitEngine {
        scans: Vec<f64>,
        areas: Vec<f64>,
        requests: Vec<SplitRequest>,
    }

    impl ChromatogramEngine for SplitEngine {
        fn detect_isotopic_probes(
            &mut self,
            _request: &ProbeRequest,
        ) -> Result<Vec<IsotopeProbes>, PeakCalculationError> {
            Ok(Vec::new())
        }

        fn split_shared_peak(
            &mut self,
            request: &SplitRequest,
        ) -> Result<Vec<IsotopeProbes>, PeakCalculationError> {
            self.requests.push(request.clone());
            Ok(request
                .positions
                .iter()
                .zip(self.areas.iter())
                .map(|(pos, area)| {
                    let mut probes = IsotopeProbes::new();
                    probes.insert(
                        0,
                        vec![ProbeSet::new(request.mz, 0, pos - 0.05, *pos, pos + 0.05, *area)],
                    );
                    probes
                })
                .collect())
        }

        fn msn_scan_times(&self, _mz: f64, _lower: f64, _upper: f64) -> Vec<f64> {
            self.scans.clone()
        }
    }

    fn catalog() -> QueryCatalog {
        (1..=5).map(|k| make_query(k, "PC")).collect()
    }

    fn table() -> ThresholdTable {
        ThresholdTable::new(RuleThresholds::default())
    }

    fn two_partner_peak() -> SharedPeak {
        SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("184", 900.0), ("a", 600.0)]),
                make_contribution(2, "PC", 10.0, &[("184", 900.0), ("b", 400.0)]),
            ],
            10.0,
        )
    }

    #[test]
    fn test_distinct_fragment_gate() {
        let peak = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("184", 900.0)]),
                make_contribution(2, "PC", 10.0, &[("184", 900.0), ("b", 400.0)]),
                make_contribution(3, "PC", 10.0, &[("c", 300.0)]),
            ],
            10.0,
        );
        let (peak, removed) = distinct_fragment_gate(peak);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].contribution.analyte, AnalyteKey(1));
        assert_eq!(removed[0].reason, RemovalReason::NoDistinctFragments);
        // "184" is now distinct to the second partner
        assert!(peak.contributions[0].distinct.contains("184"));

        let (again, removed) = distinct_fragment_gate(peak.clone());
        assert!(removed.is_empty());
        assert_eq!(again, peak);
    }

    #[test]
    fn test_coverage_gate() {
        let table = table();
        // total intensity 2000, "c" is below the 5% base peak floor of 50
        let peak = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("184", 900.0), ("a", 600.0)]),
                make_contribution(2, "PC", 10.0, &[("184", 900.0), ("c", 20.0)]),
            ],
            10.0,
        );
        let (peak, removed) = coverage_gate(peak, &table);
        assert_eq!(peak.len(), 1);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].contribution.analyte, AnalyteKey(2));
        assert!(matches!(
            removed[0].reason,
            RemovalReason::InsufficientCoverage { .. }
        ));

        let (peak, removed) = coverage_gate(two_partner_peak(), &table);
        assert!(removed.is_empty());
        assert_eq!(peak.len(), 2);

        // A rival's distinct fragments do not explain this partner's spectrum
        let peak = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("184", 900.0), ("a", 1500.0)]),
                make_contribution(2, "PC", 10.0, &[("184", 900.0), ("c", 60.0)]),
            ],
            10.0,
        );
        let (peak, removed) = coverage_gate(peak, &table);
        assert_eq!(peak.len(), 1);
        assert_eq!(peak.contributions[0].analyte, AnalyteKey(1));
        match removed[0].reason {
            RemovalReason::InsufficientCoverage { coverage } => {
                assert!((coverage - 0.03).abs() < 1e-9)
            }
            _ => panic!("Unexpected reason {:?}", removed[0].reason),
        }
    }

    #[test]
    fn test_minor_contribution_gate() {
        let mut thresholds = RuleThresholds::default();
        thresholds.isobar_exclusion_ratio = 0.2;
        let table = ThresholdTable::new(thresholds);
        let peak = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("a", 600.0)]),
                make_contribution(2, "PC", 10.0, &[("b", 500.0)]),
                make_contribution(3, "PC", 10.0, &[("c", 100.0)]),
            ],
            10.0,
        );
        let (peak, removed) = minor_contribution_gate(peak, &table);
        assert_eq!(removed.len(), 1);
        match removed[0].reason {
            RemovalReason::MinorContribution { ratio } => {
                assert!((ratio - 100.0 / 1100.0).abs() < 1e-9)
            }
            _ => panic!("Unexpected reason {:?}", removed[0].reason),
        }
        assert_eq!(peak.len(), 2);

        // The strongest partner is kept even if everyone is below the ratio
        let mut thresholds = RuleThresholds::default();
        thresholds.isobar_exclusion_ratio = 1.0;
        let table = ThresholdTable::new(thresholds);
        let (peak, removed) = minor_contribution_gate(two_partner_peak(), &table);
        assert_eq!(removed.len(), 1);
        assert_eq!(peak.contributions[0].analyte, AnalyteKey(1));
    }

    #[test]
    fn test_far_rt_gate() {
        let table = table();
        let peak = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("a", 950.0)]),
                make_contribution(2, "PC", 10.0, &[("b", 50.0)]),
            ],
            10.0,
        );
        let mut references = AnalyteMap::default();
        references.insert(AnalyteKey(2), vec![7.5, 8.0]);
        let (reduced, removed) = far_rt_gate(peak.clone(), &references, &table);
        assert_eq!(reduced.len(), 1);
        match removed[0].reason {
            RemovalReason::FarFromOtherHits { distance, .. } => {
                assert!((distance - 2.0).abs() < 1e-9)
            }
            _ => panic!("Unexpected reason {:?}", removed[0].reason),
        }

        // References on both sides say nothing about direction
        references.insert(AnalyteKey(2), vec![8.0, 12.0]);
        let (reduced, removed) = far_rt_gate(peak.clone(), &references, &table);
        assert!(removed.is_empty());
        assert_eq!(reduced.len(), 2);

        // Too close to the other hit
        references.insert(AnalyteKey(2), vec![9.5]);
        let (_, removed) = far_rt_gate(peak, &references, &table);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_percental_shares() {
        let shares = percental_shares(&[600.0, 400.0]);
        assert!((shares[0] - 60.0).abs() < 1e-9);
        assert!((shares[1] - 40.0).abs() < 1e-9);
        assert_eq!(percental_shares(&[0.0, 0.0, 0.0, 0.0]), vec![25.0; 4]);
        let shares = percental_shares(&[3.0, 5.0, 7.0]);
        assert!((shares.iter().sum::<f64>() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_percental_split() {
        let catalog = catalog();
        let table = table();
        let params = QuantParams::default();
        let mut engine = SplitEngine::default();
        let mut attacher = EvidenceAttacher::new(TableEvaluator::default());
        let mut disentangler =
            Disentangler::new(&mut engine, &mut attacher, &catalog, &table, &params);
        let result = disentangler.disentangle(vec![two_partner_peak()], AnalyteMap::default());
        assert_eq!(result.len(), 1);
        let peak = &result[0];
        assert_eq!(peak.state, PeakState::SplitPercentally);
        assert_eq!(peak.pre_split.len(), 2);
        let shares: Vec<f64> = peak
            .survivors
            .iter()
            .map(|s| s.percental_split.unwrap())
            .collect();
        assert!((shares[0] - 60.0).abs() < 1e-9);
        assert!((shares[1] - 40.0).abs() < 1e-9);
        assert!(engine.requests.is_empty());
    }

    #[test]
    fn test_physical_split() {
        let catalog = catalog();
        let table = table();
        let params = QuantParams::default();
        let mut engine = SplitEngine {
            scans: vec![9.95, 10.0, 10.05],
            areas: vec![550.0, 450.0],
            ..Default::default()
        };
        let mut attacher = EvidenceAttacher::new(TableEvaluator::default());
        let mut disentangler =
            Disentangler::new(&mut engine, &mut attacher, &catalog, &table, &params);
        let result = disentangler.disentangle(vec![two_partner_peak()], AnalyteMap::default());
        let peak = &result[0];
        assert_eq!(peak.state, PeakState::SplitPhysically);
        assert_eq!(peak.survivors.len(), 2);
        assert_eq!(peak.survivors[0].area, 550.0);
        assert!(peak.survivors[0].origin.is_some());
        assert!(peak.survivors.iter().all(|s| s.percental_split.is_none()));
        assert_eq!(engine.requests.len(), 1);
        let request = &engine.requests[0];
        assert!((request.borders[0].0 - 0.01).abs() < 1e-9);
        assert!((request.borders[0].1 - 0.02).abs() < 1e-9);

        // A sub-peak without area falls back to the percental split
        let mut engine = SplitEngine {
            scans: vec![9.95, 10.05],
            areas: vec![1000.0, 0.0],
            ..Default::default()
        };
        let mut disentangler =
            Disentangler::new(&mut engine, &mut attacher, &catalog, &table, &params);
        let result = disentangler.disentangle(vec![two_partner_peak()], AnalyteMap::default());
        assert_eq!(result[0].state, PeakState::SplitPercentally);
    }

    #[test]
    fn test_strict_reevaluation() {
        let catalog = catalog();
        let table = table();
        let params = QuantParams::default();
        let mut engine = SplitEngine::default();
        let mut evaluator = TableEvaluator::default();
        evaluator.strict.insert(
            "PC".into(),
            Evaluation::Evidence(MsnEvidence::new(Confidence::FragmentsDetected, 1.0, 1.0)),
        );
        let mut attacher = EvidenceAttacher::new(evaluator);
        let peak = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("184", 900.0)]),
                make_contribution(2, "PC", 10.0, &[("184", 900.0), ("b", 400.0)]),
            ],
            10.0,
        );
        let mut disentangler =
            Disentangler::new(&mut engine, &mut attacher, &catalog, &table, &params);
        let result = disentangler.disentangle(vec![peak.clone()], AnalyteMap::default());
        assert_eq!(result[0].state, PeakState::Resolved);
        assert_eq!(result[0].survivors[0].analyte, AnalyteKey(2));
        assert_eq!(
            result[0].survivors[0].confidence(),
            Confidence::FragmentsDetected
        );
        assert_eq!(attacher.evaluator().calls, 1);

        attacher
            .evaluator_mut()
            .strict
            .insert("PC".into(), Evaluation::Discard { track: true });
        let mut disentangler =
            Disentangler::new(&mut engine, &mut attacher, &catalog, &table, &params);
        let result = disentangler.disentangle(vec![peak], AnalyteMap::default());
        assert_eq!(result[0].state, PeakState::Unclaimed);
        assert_eq!(result[0].removed.len(), 2);
        assert_eq!(
            result[0].removed[1].reason,
            RemovalReason::StrictEvaluationFailed
        );
    }

    fn lenient_table() -> ThresholdTable {
        let mut thresholds = RuleThresholds::default();
        thresholds.min_spectrum_coverage = 0.05;
        ThresholdTable::new(thresholds)
    }

    fn far_reason(removal: &Removal) -> (AnalyteKey, f64) {
        match removal.reason {
            RemovalReason::FarFromOtherHits { distance, .. } => {
                (removal.contribution.analyte, distance)
            }
            _ => panic!("Unexpected reason {:?}", removal.reason),
        }
    }

    #[test]
    fn test_far_rt_follows_resolved_peak() {
        let catalog = catalog();
        let table = lenient_table();
        let params = QuantParams::default();
        let mut engine = SplitEngine::default();
        let mut attacher = EvidenceAttacher::new(TableEvaluator::default());
        // Settled to analyte 1 by the distinct fragment gate
        let early = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 5.0, &[("184", 900.0), ("x", 600.0)]),
                make_contribution(2, "PC", 5.0, &[("184", 900.0)]),
            ],
            5.0,
        );
        let late = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 10.0, &[("x", 150.0)]),
                make_contribution(3, "PC", 10.0, &[("y", 1900.0)]),
            ],
            10.0,
        );

        let mut disentangler =
            Disentangler::new(&mut engine, &mut attacher, &catalog, &table, &params);
        let result = disentangler.disentangle(vec![late.clone()], AnalyteMap::default());
        assert_eq!(result[0].state, PeakState::SplitPercentally);

        let result = disentangler.disentangle(vec![early, late], AnalyteMap::default());
        assert_eq!(result[0].state, PeakState::Resolved);
        assert_eq!(result[0].survivors[0].analyte, AnalyteKey(1));
        let late = &result[1];
        assert_eq!(late.state, PeakState::Resolved);
        assert_eq!(late.survivors[0].analyte, AnalyteKey(3));
        assert_eq!(late.removed.len(), 1);
        let (analyte, distance) = far_reason(&late.removed[0]);
        assert_eq!(analyte, AnalyteKey(1));
        assert!((distance - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_far_rt_waits_for_smaller_peak() {
        let catalog = catalog();
        let table = lenient_table();
        let params = QuantParams::default();
        let mut engine = SplitEngine::default();
        let mut attacher = EvidenceAttacher::new(TableEvaluator::default());
        // Earlier, but it must wait until the two partner peak of analyte 1 is settled
        let crowded = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 1.0, &[("x", 150.0)]),
                make_contribution(3, "PC", 1.0, &[("y", 1900.0)]),
                make_contribution(5, "PC", 1.0, &[("z", 1800.0)]),
            ],
            1.0,
        );
        let pair = SharedPeak::new(
            vec![
                make_contribution(1, "PC", 5.0, &[("w", 1900.0)]),
                make_contribution(4, "PC", 5.0, &[("v", 150.0)]),
            ],
            5.0,
        );
        let mut references = AnalyteMap::default();
        references.insert(AnalyteKey(4), vec![8.0]);

        let mut disentangler =
            Disentangler::new(&mut engine, &mut attacher, &catalog, &table, &params);
        let result = disentangler.disentangle(vec![crowded, pair], references);

        let pair = &result[1];
        assert_eq!(pair.state, PeakState::Resolved);
        assert_eq!(pair.survivors[0].analyte, AnalyteKey(1));
        let (analyte, distance) = far_reason(&pair.removed[0]);
        assert_eq!(analyte, AnalyteKey(4));
        assert!((distance - 3.0).abs() < 1e-9);

        let crowded = &result[0];
        assert_eq!(crowded.state, PeakState::SplitPercentally);
        let (analyte, distance) = far_reason(&crowded.removed[0]);
        assert_eq!(analyte, AnalyteKey(1));
        assert!((distance - 4.0).abs() < 1e-9);
        let kept: Vec<AnalyteKey> = crowded.survivors.iter().map(|s| s.analyte).collect();
        assert_eq!(kept, vec![AnalyteKey(3), AnalyteKey(5)]);
    }
}
