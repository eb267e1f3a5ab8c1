/*! MSn fragment evidence supporting an identification */
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// How much MSn evidence supports an identification, in strictly increasing
/// order of confidence.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Confidence {
    #[default]
    None,
    HeadGroupDetected,
    FragmentsDetected,
    PositionDetected,
}

impl Confidence {
    /// The levels that carry MSn evidence, from most to least confident
    pub const DESCENDING: [Confidence; 3] = [
        Confidence::PositionDetected,
        Confidence::FragmentsDetected,
        Confidence::HeadGroupDetected,
    ];

    pub fn has_msn(&self) -> bool {
        *self > Confidence::None
    }
}

impl Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A fragment ion matched in the MSn spectra of an identification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// The name of the fragment, which is its identity when comparing the evidence
    /// of competing identifications
    pub name: String,
    pub mz: f64,
    pub intensity: f64,
    /// The retention time of the scan the fragment was most intense in
    pub time: f64,
}

impl Fragment {
    pub fn new(name: impl Into<String>, mz: f64, intensity: f64, time: f64) -> Self {
        Self {
            name: name.into(),
            mz,
            intensity,
            time,
        }
    }
}

/// The fragment-level evidence the rule evaluator found for an identification
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsnEvidence {
    pub confidence: Confidence,
    /// Head group fragments and neutral losses, keyed by fragment name
    pub head_group_fragments: BTreeMap<String, Fragment>,
    /// Chain fragments, keyed by chain then by fragment name
    pub chain_fragments: BTreeMap<String, BTreeMap<String, Fragment>>,
    /// The chain compositions supported by the chain fragments, e.g. `16:0_18:1`
    pub molecular_species: Vec<String>,
    /// The position assignments supported by the evidence, e.g. `16:0/18:1`
    pub positions: Vec<String>,
    /// The base peak intensity of the spectra the evidence was drawn from
    pub base_peak: f64,
    /// The summed intensity of the spectra the evidence was drawn from
    pub total_intensity: f64,
    /// The retention times of the MSn scans that contributed
    pub scan_times: Vec<f64>,
}

impl MsnEvidence {
    pub fn new(confidence: Confidence, base_peak: f64, total_intensity: f64) -> Self {
        Self {
            confidence,
            base_peak,
            total_intensity,
            ..Default::default()
        }
    }

    /// Evidence standing in for an identification whose rules could not be evaluated
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn add_head_group_fragment(&mut self, fragment: Fragment) {
        self.head_group_fragments
            .insert(fragment.name.clone(), fragment);
    }

    pub fn add_chain_fragment(&mut self, chain: impl Into<String>, fragment: Fragment) {
        self.chain_fragments
            .entry(chain.into())
            .or_default()
            .insert(fragment.name.clone(), fragment);
    }

    pub fn with_head_group_fragment(mut self, fragment: Fragment) -> Self {
        self.add_head_group_fragment(fragment);
        self
    }

    pub fn with_chain_fragment(mut self, chain: impl Into<String>, fragment: Fragment) -> Self {
        self.add_chain_fragment(chain, fragment);
        self
    }

    pub fn with_molecular_species(mut self, species: impl Into<String>) -> Self {
        self.molecular_species.push(species.into());
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.positions.push(position.into());
        self
    }

    pub fn with_scan_times(mut self, scan_times: Vec<f64>) -> Self {
        self.scan_times = scan_times;
        self
    }

    /// All fragments, head group fragments first. A fragment reported both as a
    /// head group and as a chain fragment is only yielded once.
    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        let mut seen = BTreeSet::new();
        self.head_group_fragments
            .values()
            .chain(self.chain_fragments.values().flat_map(|c| c.values()))
            .filter(move |f| seen.insert(f.name.as_str()))
    }

    pub fn fragment_names(&self) -> BTreeSet<&str> {
        self.fragments().map(|f| f.name.as_str()).collect()
    }

    pub fn get_fragment(&self, name: &str) -> Option<&Fragment> {
        self.head_group_fragments.get(name).or_else(|| {
            self.chain_fragments
                .values()
                .find_map(|chain| chain.get(name))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.head_group_fragments.is_empty() && self.chain_fragments.values().all(|c| c.is_empty())
    }

    /// The fragment intensity a fragment must reach relative to the base peak
    pub fn intensity_floor(&self, base_peak_cutoff: f64) -> f64 {
        self.base_peak * base_peak_cutoff
    }

    /// The names of the species this evidence supports at `level`. Head group
    /// evidence carries no species beyond the class of the identification.
    pub fn signature(&self, level: Confidence) -> BTreeSet<&str> {
        if self.confidence < level {
            return BTreeSet::new();
        }
        match level {
            Confidence::PositionDetected => self.positions.iter().map(|s| s.as_str()).collect(),
            Confidence::FragmentsDetected => {
                self.molecular_species.iter().map(|s| s.as_str()).collect()
            }
            Confidence::HeadGroupDetected | Confidence::None => BTreeSet::new(),
        }
    }

    /// Drop any positional assignment, demoting positional evidence to
    /// fragment-level evidence.
    pub fn without_positions(mut self) -> Self {
        self.positions.clear();
        if self.confidence == Confidence::PositionDetected {
            self.confidence = Confidence::FragmentsDetected;
        }
        self
    }
}
