/*! Attaching MSn fragment evidence to analyte hits */
use tracing::{debug, trace};

use crate::evidence::MsnEvidence;
use crate::identification::Identification;
use crate::params::{QuantParams, RuleThresholds};
use crate::query::AnalyteQuery;
use crate::traits::{Evaluation, EvaluationMode, RuleEvaluator};

/// The result of evaluating the fragmentation rules of one hit
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    /// The hit with its evidence attached
    Attached(Identification),
    /// The rules say the hit must not be reported. If `track` is set the hit should
    /// still be kept in the removed hits table.
    Discarded {
        identification: Identification,
        track: bool,
    },
}

impl Attachment {
    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded { .. })
    }

    pub fn identification(&self) -> &Identification {
        match self {
            Self::Attached(identification) => identification,
            Self::Discarded { identification, .. } => identification,
        }
    }

    pub fn into_identification(self) -> Identification {
        match self {
            Self::Attached(identification) => identification,
            Self::Discarded { identification, .. } => identification,
        }
    }
}

/// Drives a [`RuleEvaluator`] over analyte hits, turning rule lookup failures into
/// missing evidence.
#[derive(Debug)]
pub struct EvidenceAttacher<R: RuleEvaluator> {
    evaluator: R,
}

impl<R: RuleEvaluator> EvidenceAttacher<R> {
    pub fn new(evaluator: R) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &R {
        &self.evaluator
    }

    pub fn evaluator_mut(&mut self) -> &mut R {
        &mut self.evaluator
    }

    pub fn into_inner(self) -> R {
        self.evaluator
    }

    /// The thresholds in effect for `query`, falling back to `params` when the
    /// class has no usable rule.
    pub fn thresholds_for(&self, query: &AnalyteQuery, params: &QuantParams) -> RuleThresholds {
        match self
            .evaluator
            .class_thresholds(&query.class, &query.modification)
        {
            Ok(class) => RuleThresholds::resolve(params, Some(&class)),
            Err(err) => {
                debug!("Using default thresholds for {}: {err}", query.label());
                RuleThresholds::resolve(params, None)
            }
        }
    }

    /// Evaluate the rules of `query` against `identification` and attach what they
    /// found.
    ///
    /// A missing or invalid rule is not an error. In [`EvaluationMode::Standard`] the
    /// hit gets [`MsnEvidence::absent`], in [`EvaluationMode::StrictSingleSpecies`]
    /// it keeps whatever evidence it already carried.
    pub fn attach(
        &mut self,
        query: &AnalyteQuery,
        mut identification: Identification,
        mode: EvaluationMode,
        ignore_positional_evidence: bool,
    ) -> Attachment {
        match self.evaluator.evaluate(query, &identification, mode) {
            Ok(Evaluation::Evidence(evidence)) => {
                let evidence = if ignore_positional_evidence {
                    evidence.without_positions()
                } else {
                    evidence
                };
                trace!(
                    "{} evaluated to {} in {mode:?} mode",
                    identification.label(),
                    evidence.confidence
                );
                identification.evidence = Some(evidence);
                Attachment::Attached(identification)
            }
            Ok(Evaluation::Discard { track }) => {
                debug!(
                    "{} discarded by its rules in {mode:?} mode (tracked: {track})",
                    identification.label()
                );
                Attachment::Discarded {
                    identification,
                    track,
                }
            }
            Err(err) => {
                debug!("No MSn evidence for {}: {err}", identification.label());
                match mode {
                    EvaluationMode::Standard => {
                        identification.evidence = Some(MsnEvidence::absent());
                    }
                    EvaluationMode::StrictSingleSpecies => {
                        if identification.evidence.is_none() {
                            identification.evidence = Some(MsnEvidence::absent());
                        }
                    }
                }
                Attachment::Attached(identification)
            }
        }
    }
}
