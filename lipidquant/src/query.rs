//! Analyte definitions to quantify and the catalog relating isobaric definitions
use std::collections::hash_map::{HashMap, Values};
use std::fmt::Display;
use std::hash::Hash;

use identity_hash::{BuildIdentityHasher, IdentityHashable};
use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};

/// An opaque identifier for an analyte definition
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnalyteKey(pub usize);

impl Hash for AnalyteKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(self.0);
    }
}

impl IdentityHashable for AnalyteKey {}

pub type BuildIdentityHasherAnalyteKey = BuildIdentityHasher<AnalyteKey>;

/// A map keyed by [`AnalyteKey`]
pub type AnalyteMap<T> = HashMap<AnalyteKey, T, BuildIdentityHasherAnalyteKey>;

impl From<usize> for AnalyteKey {
    fn from(value: usize) -> Self {
        AnalyteKey(value)
    }
}

impl Display for AnalyteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The expected retention time of an analyte and how far before and after
/// it a hit may be, in minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionWindow {
    pub time: f64,
    pub before: f64,
    pub after: f64,
}

impl RetentionWindow {
    pub fn new(time: f64, before: f64, after: f64) -> Self {
        Self {
            time,
            before,
            after,
        }
    }

    pub fn contains(&self, time: f64) -> bool {
        (self.time - self.before) <= time && time <= (self.time + self.after)
    }
}

/// The definition of one analyte to quantify, together with the other definitions
/// whose signal it competes with.
///
/// Immutable for the duration of one quantification pass.
#[derive(Debug, Clone)]
pub struct AnalyteQuery {
    pub key: AnalyteKey,
    /// The lipid class, used to look up fragmentation rules, e.g. `PC`
    pub class: String,
    /// The species within the class, e.g. `34:1`
    pub analyte: String,
    pub analyte_formula: String,
    /// The adduct or modification, e.g. `H`
    pub modification: String,
    pub modification_formula: String,
    /// The theoretical m/z of the monoisotopic ion
    pub mz: f64,
    pub charge: i32,
    pub mz_tolerance: Tolerance,
    pub retention_time: Option<RetentionWindow>,
    /// The expected relative abundance of each isotope, starting at the monoisotopic peak
    pub isotope_probabilities: Vec<f64>,
    /// Whether the isotopic series extends towards lower masses
    pub negative_isotopes: bool,
    /// The other analyte definitions competing for the same signal
    pub isobars: Vec<AnalyteKey>,
}

impl AnalyteQuery {
    pub fn new<K: Into<AnalyteKey>>(
        key: K,
        class: impl Into<String>,
        analyte: impl Into<String>,
        modification: impl Into<String>,
        mz: f64,
        charge: i32,
    ) -> Self {
        Self {
            key: key.into(),
            class: class.into(),
            analyte: analyte.into(),
            analyte_formula: String::new(),
            modification: modification.into(),
            modification_formula: String::new(),
            mz,
            charge,
            mz_tolerance: Tolerance::PPM(10.0),
            retention_time: None,
            isotope_probabilities: vec![1.0],
            negative_isotopes: false,
            isobars: Vec::new(),
        }
    }

    pub fn with_formulas(
        mut self,
        analyte_formula: impl Into<String>,
        modification_formula: impl Into<String>,
    ) -> Self {
        self.analyte_formula = analyte_formula.into();
        self.modification_formula = modification_formula.into();
        self
    }

    pub fn with_retention_time(mut self, window: RetentionWindow) -> Self {
        self.retention_time = Some(window);
        self
    }

    pub fn with_isotope_probabilities(mut self, probabilities: Vec<f64>, negative: bool) -> Self {
        self.isotope_probabilities = probabilities;
        self.negative_isotopes = negative;
        self
    }

    pub fn with_tolerance(mut self, mz_tolerance: Tolerance) -> Self {
        self.mz_tolerance = mz_tolerance;
        self
    }

    pub fn with_isobars<K: Into<AnalyteKey>, I: IntoIterator<Item = K>>(
        mut self,
        isobars: I,
    ) -> Self {
        self.isobars = isobars.into_iter().map(|k| k.into()).collect();
        self
    }

    /// A human readable name like `PC 34:1 [H]`
    pub fn label(&self) -> String {
        format!("{} {} [{}]", self.class, self.analyte, self.modification)
    }
}

impl PartialEq for AnalyteQuery {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for AnalyteQuery {}

impl Hash for AnalyteQuery {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// All analyte definitions of one quantification run
#[derive(Debug, Default, Clone)]
pub struct QueryCatalog {
    queries: AnalyteMap<AnalyteQuery>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, query: AnalyteQuery) {
        if let Some(prev) = self.queries.insert(query.key, query) {
            tracing::warn!("Replaced analyte definition {} ({})", prev.key, prev.label());
        }
    }

    pub fn get(&self, key: &AnalyteKey) -> Option<&AnalyteQuery> {
        self.queries.get(key)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter(&self) -> Values<AnalyteKey, AnalyteQuery> {
        self.queries.values()
    }

    /// The analyte definition `key` followed by its isobars, in ascending key order
    /// after the primary. Isobars that are missing from the catalog or whose m/z is
    /// not within the primary's tolerance are skipped.
    pub fn neighborhood(&self, key: &AnalyteKey) -> Option<Vec<&AnalyteQuery>> {
        let primary = self.queries.get(key)?;
        let mut siblings: Vec<&AnalyteQuery> = Vec::with_capacity(primary.isobars.len());
        for k in primary.isobars.iter() {
            if k == key || siblings.iter().any(|s| s.key == *k) {
                continue;
            }
            match self.queries.get(k) {
                Some(sibling) => {
                    if primary.mz_tolerance.test(sibling.mz, primary.mz)
                        && sibling.charge == primary.charge
                    {
                        siblings.push(sibling)
                    } else {
                        tracing::debug!(
                            "Skipping isobar {} of {}, m/z {} is not within {:?} of {}",
                            sibling.label(),
                            primary.label(),
                            sibling.mz,
                            primary.mz_tolerance,
                            primary.mz
                        );
                    }
                }
                None => {
                    tracing::warn!("Isobar {k} of {} is not in the catalog", primary.label());
                }
            }
        }
        siblings.sort_by_key(|s| s.key);
        let mut group = Vec::with_capacity(siblings.len() + 1);
        group.push(primary);
        group.extend(siblings);
        Some(group)
    }
}

impl FromIterator<AnalyteQuery> for QueryCatalog {
    fn from_iter<T: IntoIterator<Item = AnalyteQuery>>(iter: T) -> Self {
        let mut catalog = Self::new();
        for q in iter {
            catalog.add(q);
        }
        catalog
    }
}
