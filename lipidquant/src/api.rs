//! High level APIs for quantifying an analyte definition together with its isobars
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::identification::{
    insert_hit, sorted_hits, AnalyteHits, HitMap, Identification, IdentificationBuilder,
};
use crate::msn::{Attachment, EvidenceAttacher};
use crate::params::{AreaCutoff, MsIdentificationOrder, QuantParams, RuleThresholds, ThresholdTable};
use crate::query::{AnalyteKey, AnalyteMap, AnalyteQuery, QueryCatalog};
use crate::shared_peak::{Disentangler, SharedPeakDetector};
use crate::traits::{
    ChromatogramEngine, EvaluationMode, PeakCalculationError, ProbeRequest, QuantificationError,
    RuleEvaluator,
};
use crate::union::EvidenceUnionMerger;

/// The outcome of quantifying one analyte definition and its isobars.
///
/// All three tables are keyed by analyte definition and then by the retention time
/// key of each hit.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantResult {
    /// The hits reported for each analyte definition
    pub identifications: AnalyteHits,
    /// Hits the fragmentation rules discarded but asked to keep track of, and
    /// partners removed from shared peaks
    pub removed: AnalyteHits,
    /// Hits as they were before their shared peak was split among several analytes
    pub pre_split: AnalyteHits,
}

impl QuantResult {
    pub fn get(&self, key: &AnalyteKey) -> Option<&HitMap> {
        self.identifications.get(key)
    }

    /// The hits of `key` ordered by retention time
    pub fn hits_of(&self, key: &AnalyteKey) -> Vec<&Identification> {
        self.identifications
            .get(key)
            .map(|hits| sorted_hits(hits).into_iter().map(|(_, h)| h).collect())
            .unwrap_or_default()
    }

    /// The summed area attributed to `key`, honoring percental splits
    pub fn total_area(&self, key: &AnalyteKey) -> f64 {
        self.identifications
            .get(key)
            .map(|hits| hits.values().map(|h| h.quantified_area()).sum())
            .unwrap_or_default()
    }

    fn record(table: &mut AnalyteHits, identification: Identification) {
        insert_hit(table.entry(identification.analyte).or_default(), identification);
    }
}

/// Quantify the analyte definition `key` of `catalog` together with its isobars in a
/// single shot.
///
/// # Arguments
/// - `engine`: The peak detection engine that extracts chromatographic regions
/// - `evaluator`: The MSn fragmentation rule evaluator
/// - `params`: The global defaults of every threshold
/// - `catalog`: All analyte definitions of the run
/// - `key`: The analyte definition to quantify
///
/// # Note
/// Internally, this function creates a [`QuantificationEngine`], calls
/// [`QuantificationEngine::quantify`] and discards the engine. Prefer keeping a
/// [`QuantificationEngine`] around when quantifying many analyte definitions.
pub fn quantify<E: ChromatogramEngine, R: RuleEvaluator>(
    engine: E,
    evaluator: R,
    params: QuantParams,
    catalog: &QueryCatalog,
    key: &AnalyteKey,
) -> Result<QuantResult, QuantificationError> {
    let mut engine = QuantificationEngine::new(engine, evaluator, params);
    engine.quantify(catalog, key)
}

/// Drives peak detection, MSn evidence, shared peak disentangling and evidence
/// union for one analyte definition and its isobaric siblings at a time.
///
/// The engine owns its collaborators. Quantifying analyte definitions
/// concurrently means one [`QuantificationEngine`] per worker, sharing an
/// [`AreaCutoff`] with their chromatogram engine through
/// [`QuantificationEngine::with_area_cutoff`] if needed.
#[derive(Debug)]
pub struct QuantificationEngine<E: ChromatogramEngine, R: RuleEvaluator> {
    engine: E,
    attacher: EvidenceAttacher<R>,
    params: QuantParams,
    cutoff: AreaCutoff,
}

impl<E: ChromatogramEngine, R: RuleEvaluator> QuantificationEngine<E, R> {
    /// Create a new [`QuantificationEngine`]
    /// # Arguments
    /// - `engine`: The peak detection engine that extracts chromatographic regions
    /// - `evaluator`: The MSn fragmentation rule evaluator
    /// - `params`: The global defaults of every threshold
    pub fn new(engine: E, evaluator: R, params: QuantParams) -> Self {
        let cutoff = AreaCutoff::new(params.base_peak_area_cutoff);
        Self {
            engine,
            attacher: EvidenceAttacher::new(evaluator),
            params,
            cutoff,
        }
    }

    /// Use `cutoff` as the MS1 area cutoff, e.g. one also held by the chromatogram
    /// engine
    pub fn with_area_cutoff(mut self, cutoff: AreaCutoff) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn params(&self) -> &QuantParams {
        &self.params
    }

    pub fn area_cutoff(&self) -> &AreaCutoff {
        &self.cutoff
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn evaluator(&self) -> &R {
        self.attacher.evaluator()
    }

    pub fn evaluator_mut(&mut self) -> &mut R {
        self.attacher.evaluator_mut()
    }

    pub fn into_parts(self) -> (E, R, QuantParams) {
        (self.engine, self.attacher.into_inner(), self.params)
    }

    /// Quantify the analyte definition `key` of `catalog` and its isobars.
    ///
    /// The MS1 area cutoff is tightened to the class-specific cutoff of `key`, if it
    /// has one, until this method returns.
    ///
    /// # Errors
    /// A [`QuantificationError::UnknownAnalyte`] if `key` is not in `catalog`, and a
    /// [`QuantificationError::PeakCalculation`] if peak detection fails for `key`.
    /// Peak detection failures of an isobar only drop that isobar's hits.
    #[tracing::instrument(skip_all, level = "debug", fields(analyte = %key))]
    pub fn quantify(
        &mut self,
        catalog: &QueryCatalog,
        key: &AnalyteKey,
    ) -> Result<QuantResult, QuantificationError> {
        let neighborhood = catalog
            .neighborhood(key)
            .ok_or(QuantificationError::UnknownAnalyte(*key))?;

        let mut table = ThresholdTable::new(RuleThresholds::from(&self.params));
        for query in neighborhood.iter() {
            table.insert(query.key, self.attacher.thresholds_for(query, &self.params));
        }
        let _cutoff = self.cutoff.tighten(table.get(key).ms1_area_cutoff);

        let mut result = QuantResult::default();
        let mut hits = AnalyteHits::default();
        for query in neighborhood.iter() {
            let removed = result.removed.entry(query.key).or_default();
            let found = match self.detect(query, table.get(&query.key), removed) {
                Ok(found) => found,
                Err(source) if query.key == *key => {
                    return Err(QuantificationError::PeakCalculation {
                        key: query.key,
                        source,
                    })
                }
                Err(err) => {
                    warn!("Dropping isobar {} of {key}: {err}", query.label());
                    HitMap::new()
                }
            };
            hits.insert(query.key, found);
        }

        let order: Vec<AnalyteKey> = neighborhood.iter().map(|q| q.key).collect();
        let detector = SharedPeakDetector::new(self.params.tie_tolerance);
        let (peaks, mut remainder) = detector.detect(hits, &order);
        debug!("Found {} shared peaks among {} analytes", peaks.len(), order.len());

        let references: AnalyteMap<Vec<f64>> = remainder
            .iter()
            .map(|(k, found)| {
                let times = found
                    .values()
                    .filter(|h| h.has_msn())
                    .filter_map(|h| h.rt)
                    .collect();
                (*k, times)
            })
            .collect();

        let disentangled = Disentangler::new(
            &mut self.engine,
            &mut self.attacher,
            catalog,
            &table,
            &self.params,
        )
        .disentangle(peaks, references);

        for peak in disentangled {
            trace!("Shared peak at {:.2} ended {:?}", peak.rt, peak.state);
            for survivor in peak.survivors {
                insert_hit(remainder.entry(survivor.analyte).or_default(), survivor);
            }
            for removal in peak.removed {
                QuantResult::record(&mut result.removed, removal.contribution.identification);
            }
            for original in peak.pre_split {
                QuantResult::record(&mut result.pre_split, original);
            }
        }

        for query in neighborhood.iter() {
            let found = remainder.remove(&query.key).unwrap_or_default();
            let merger = EvidenceUnionMerger::from(table.get(&query.key));
            let removed = result.removed.entry(query.key).or_default();
            let merged = merger.merge(found, query, &mut self.attacher, removed);
            result.identifications.insert(query.key, merged);
        }
        result.removed.retain(|_, v| !v.is_empty());
        Ok(result)
    }

    /// Detect the hits of `query`, attach their MSn evidence and apply the
    /// identification order policy. Discarded hits the rules want tracked go into
    /// `removed`.
    fn detect(
        &mut self,
        query: &AnalyteQuery,
        thresholds: &RuleThresholds,
        removed: &mut HitMap,
    ) -> Result<HitMap, PeakCalculationError> {
        let request =
            ProbeRequest::for_query(query, self.params.rt_tolerance, self.cutoff.current());
        let regions = self.engine.detect_isotopic_probes(&request)?;
        let builder = IdentificationBuilder::new(query);
        let mut found = HitMap::with_capacity(regions.len());
        for probes in regions.iter() {
            let identification = builder.build(probes);
            if identification.rt.is_none() {
                trace!("Skipping a hit of {} without regions", query.label());
                continue;
            }
            match self.attacher.attach(
                query,
                identification,
                EvaluationMode::Standard,
                thresholds.ignore_positional_evidence,
            ) {
                Attachment::Attached(identification) => {
                    insert_hit(&mut found, identification);
                }
                Attachment::Discarded {
                    identification,
                    track: true,
                } => {
                    insert_hit(removed, identification);
                }
                Attachment::Discarded { .. } => {}
            }
        }
        Ok(apply_identification_order(
            found,
            thresholds.identification_order,
        ))
    }
}

/// Drop the hits that `order` says must not be reported
pub fn apply_identification_order(mut hits: HitMap, order: MsIdentificationOrder) -> HitMap {
    let drop_unconfirmed = match order {
        MsIdentificationOrder::Ms1First => false,
        MsIdentificationOrder::MsnOnly => true,
        MsIdentificationOrder::MsnFirst => hits.values().any(|h| h.has_msn()),
    };
    if drop_unconfirmed {
        hits.retain(|rt, h| {
            let keep = h.has_msn();
            if !keep {
                trace!("Dropping {rt} without MSn evidence under {order:?}");
            }
            keep
        });
    }
    hits
}
