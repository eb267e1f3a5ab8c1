use std::collections::HashSet;

use tracing::{debug, trace};

use crate::identification::{sorted_hits, AnalyteHits, Identification};
use crate::query::AnalyteKey;

use super::{Contribution, SharedPeak};

/// Groups the hits of competing analyte definitions that are the same physical
/// MS1 peak.
#[derive(Debug, Clone, Copy)]
pub struct SharedPeakDetector {
    /// The tolerance within which two apexes or borders are the same, in minutes
    pub tie_tolerance: f64,
}

impl SharedPeakDetector {
    pub fn new(tie_tolerance: f64) -> Self {
        Self { tie_tolerance }
    }

    /// Two hits are the same peak if they render to the same retention time key, or
    /// if their monoisotopic apexes or borders coincide.
    pub fn is_same_peak(&self, a: &Identification, b: &Identification) -> bool {
        match (a.rt_key(), b.rt_key()) {
            (Some(x), Some(y)) if x == y => true,
            _ => a.coincides_with(b, self.tie_tolerance),
        }
    }

    /// Compare the hits of each analyte in `order` against the unclaimed hits of every
    /// analyte after it, and move each group of coinciding hits out of `hits` into a
    /// [`SharedPeak`].
    ///
    /// Groups in which no hit has MSn evidence are not ambiguous and stay in `hits`
    /// as independent hits. The returned peaks are sorted by retention time.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn detect(
        &self,
        mut hits: AnalyteHits,
        order: &[AnalyteKey],
    ) -> (Vec<SharedPeak>, AnalyteHits) {
        let mut claimed: HashSet<(AnalyteKey, String)> = HashSet::new();
        let mut groups: Vec<Vec<(AnalyteKey, String)>> = Vec::new();

        for (i, key_i) in order.iter().enumerate() {
            let Some(hits_i) = hits.get(key_i) else {
                continue;
            };
            for (rt_i, ident_i) in sorted_hits(hits_i) {
                if claimed.contains(&(*key_i, rt_i.clone())) {
                    continue;
                }
                let mut group = vec![(*key_i, rt_i.clone())];
                for key_j in order[(i + 1)..].iter() {
                    let Some(hits_j) = hits.get(key_j) else {
                        continue;
                    };
                    let rt = ident_i.rt.unwrap_or_default();
                    let best = sorted_hits(hits_j)
                        .into_iter()
                        .filter(|(rt_j, _)| !claimed.contains(&(*key_j, (*rt_j).clone())))
                        .filter(|(_, ident_j)| self.is_same_peak(ident_i, ident_j))
                        .min_by(|(_, a), (_, b)| {
                            let da = (a.rt.unwrap_or_default() - rt).abs();
                            let db = (b.rt.unwrap_or_default() - rt).abs();
                            da.total_cmp(&db)
                        });
                    if let Some((rt_j, _)) = best {
                        trace!("{} coincides with {} at {rt_j}", ident_i.label(), key_j);
                        group.push((*key_j, rt_j.clone()));
                    }
                }
                if group.len() < 2 {
                    continue;
                }
                let has_msn = group.iter().any(|(k, rt)| {
                    hits.get(k)
                        .and_then(|m| m.get(rt))
                        .map(|ident| ident.has_msn())
                        .unwrap_or(false)
                });
                if !has_msn {
                    // Unclaimed, so its members may still join a later group
                    debug!(
                        "{} hits coincide at {} without MSn evidence, keeping them independent",
                        group.len(),
                        rt_i
                    );
                    continue;
                }
                claimed.extend(group.iter().cloned());
                groups.push(group);
            }
        }

        let mut peaks = Vec::with_capacity(groups.len());
        for group in groups {
            let contributions: Vec<Contribution> = group
                .iter()
                .filter_map(|(k, rt)| hits.get_mut(k).and_then(|m| m.remove(rt)))
                .map(Contribution::new)
                .collect();
            let rt = contributions
                .first()
                .and_then(|c| c.identification.rt)
                .unwrap_or_default();
            debug!(
                "Detected a peak at {rt:.2} shared by {} analytes",
                contributions.len()
            );
            peaks.push(SharedPeak::new(contributions, rt));
        }
        peaks.sort_by(|a, b| a.rt.total_cmp(&b.rt));
        (peaks, hits)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::evidence::{Confidence, MsnEvidence};
    use crate::identification::HitMap;
    use crate::shared_peak::test::make_identification;

    fn insert(hits: &mut AnalyteHits, ident: crate::identification::Identification) {
        let key = ident.rt_key().unwrap();
        hits.entry(ident.analyte).or_insert_with(HitMap::new).insert(key, ident);
    }

    #[test]
    fn test_detect() {
        let mut hits = AnalyteHits::default();
        let msn = MsnEvidence::new(Confidence::HeadGroupDetected, 100.0, 100.0);
        insert(&mut hits, make_identification(1, "PC", 10.0, 1000.0).with_evidence(msn.clone()));
        insert(&mut hits, make_identification(1, "PC", 12.0, 500.0));
        insert(&mut hits, make_identification(2, "PE", 10.0, 1000.0));
        // Coinciding apex within the tie tolerance, but a different key
        insert(&mut hits, make_identification(3, "PS", 10.01, 900.0));
        // MS1 only coincidence
        insert(&mut hits, make_identification(2, "PE", 12.0, 400.0));
        insert(&mut hits, make_identification(4, "PG", 15.0, 100.0));

        let detector = SharedPeakDetector::new(0.01);
        let order = [AnalyteKey(1), AnalyteKey(2), AnalyteKey(3), AnalyteKey(4)];
        let (peaks, rest) = detector.detect(hits, &order);
        assert_eq!(peaks.len(), 1);
        let peak = &peaks[0];
        assert_eq!(peak.len(), 3);
        assert_eq!(peak.rt, 10.0);
        assert_eq!(
            peak.analytes().into_iter().collect::<Vec<_>>(),
            vec![AnalyteKey(1), AnalyteKey(2), AnalyteKey(3)]
        );

        assert!(rest[&AnalyteKey(1)].contains_key("12.00"));
        assert!(!rest[&AnalyteKey(1)].contains_key("10.00"));
        assert!(rest[&AnalyteKey(2)].contains_key("12.00"));
        assert!(rest[&AnalyteKey(3)].is_empty());
        assert_eq!(rest[&AnalyteKey(4)].len(), 1);
    }

    #[test]
    fn test_same_peak() {
        let detector = SharedPeakDetector::new(0.01);
        let a = make_identification(1, "PC", 10.0, 1000.0);
        let b = make_identification(2, "PE", 10.004, 1000.0);
        let c = make_identification(2, "PE", 10.3, 1000.0);
        assert!(detector.is_same_peak(&a, &b));
        assert!(!detector.is_same_peak(&a, &c));
    }

    #[test]
    fn test_detect_skips_ms1_only_claims() {
        let mut hits = AnalyteHits::default();
        let msn = MsnEvidence::new(Confidence::HeadGroupDetected, 100.0, 100.0);
        insert(&mut hits, make_identification(1, "PC", 10.0, 1000.0));
        insert(&mut hits, make_identification(2, "PE", 10.01, 1000.0));
        insert(&mut hits, make_identification(3, "PS", 10.02, 900.0).with_evidence(msn));

        // 1 and 3 are too far apart, so the first group holds no MSn evidence and
        // must not keep 2 from pairing with 3
        let detector = SharedPeakDetector::new(0.015);
        let order = [AnalyteKey(1), AnalyteKey(2), AnalyteKey(3)];
        let (peaks, rest) = detector.detect(hits, &order);
        assert_eq!(peaks.len(), 1);
        assert_eq!(
            peaks[0].analytes().into_iter().collect::<Vec<_>>(),
            vec![AnalyteKey(2), AnalyteKey(3)]
        );
        assert!(rest[&AnalyteKey(1)].contains_key("10.00"));
        assert!(rest[&AnalyteKey(2)].is_empty());
    }
}
