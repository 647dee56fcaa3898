use crate::{
    AminoAcid, Condition, DataQualityError, Environment, Fraction, MeasurementTable, Result,
    SampleType, amino_acid::validate_amino_acids,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};
use tracing::{info, instrument, warn};

/// Mean, sample standard deviation and replicate count of a measured quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistic {
    /// Arithmetic mean.
    pub mean: f64,
    /// Sample standard deviation (ddof = 1), undefined for a single replicate.
    pub std: Option<f64>,
    /// Number of replicates.
    pub count: usize,
}

impl Statistic {
    /// Creates a statistic from already aggregated values.
    pub fn new(mean: f64, std: Option<f64>, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(DataQualityError::NoReplicates {
                statistic: "mean",
            }
            .into());
        }
        Ok(Self { mean, std, count })
    }

    /// Aggregates replicate values, returns none for an empty slice.
    pub fn from_samples(values: &[f64]) -> Option<Self> {
        let count = values.len();
        if count == 0 {
            return None;
        }
        let mean = values.iter().sum::<f64>() / count as f64;
        let std = match count {
            1 => None,
            _ => {
                let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
                Some((ss / (count - 1) as f64).sqrt())
            }
        };
        Some(Self { mean, std, count })
    }

    /// Sample variance.
    pub fn variance(&self) -> Option<f64> {
        self.std.map(|s| s * s)
    }

    /// Variance of the mean, i.e. the squared standard error.
    pub fn variance_of_mean(&self) -> Option<f64> {
        self.variance().map(|v| v / self.count as f64)
    }
}

impl Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.std {
            Some(std) => write!(f, "{:.3}±{:.3} ({})", self.mean, std, self.count),
            None => write!(f, "{:.3} ({})", self.mean, self.count),
        }
    }
}

/// Concentration and D/L statistics of one amino acid fraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FractionStats {
    /// Concentration statistic.
    pub concentration: Statistic,
    /// D/L ratio statistic, undefined if it can not be derived.
    pub dl_ratio: Option<Statistic>,
}

/// Aggregated observation of an amino acid under one condition.
///
/// Fractions measured under the condition are present, missing fractions stay `None` and are
/// never filled with zeros.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AminoAcidObservation {
    /// Condition of the replicates.
    pub condition: Condition,
    /// Observed amino acid.
    pub amino_acid: AminoAcid,
    /// Free amino acid fraction (FAA).
    pub free: Option<FractionStats>,
    /// Total hydrolysable amino acid fraction (THAA).
    pub total: Option<FractionStats>,
    /// Peptide-bound fraction derived as THAA - FAA.
    pub bound: Option<FractionStats>,
}

impl AminoAcidObservation {
    /// Returns the statistics of a fraction.
    pub fn fraction(&self, fraction: Fraction) -> Option<&FractionStats> {
        match fraction {
            Fraction::Free => self.free.as_ref(),
            Fraction::Total => self.total.as_ref(),
            Fraction::Bound => self.bound.as_ref(),
        }
    }

    /// Returns the concentration statistic of a fraction.
    pub fn concentration(&self, fraction: Fraction) -> Option<&Statistic> {
        self.fraction(fraction).map(|s| &s.concentration)
    }

    /// Returns the D/L ratio statistic of a fraction.
    pub fn dl_ratio(&self, fraction: Fraction) -> Option<&Statistic> {
        self.fraction(fraction).and_then(|s| s.dl_ratio.as_ref())
    }
}

/// Wide table of observations keyed by condition, one entry per observed amino acid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationTable {
    rows: BTreeMap<Condition, BTreeMap<AminoAcid, AminoAcidObservation>>,
}

impl ObservationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an observation, replacing an existing one of the same condition and amino acid.
    pub fn insert(&mut self, observation: AminoAcidObservation) {
        self.rows
            .entry(observation.condition)
            .or_default()
            .insert(observation.amino_acid, observation);
    }

    /// Returns the observation of an amino acid under a condition.
    pub fn get(&self, condition: &Condition, amino_acid: AminoAcid) -> Option<&AminoAcidObservation> {
        self.rows.get(condition).and_then(|r| r.get(&amino_acid))
    }

    /// Returns all observations of a condition.
    pub fn row(&self, condition: &Condition) -> Option<&BTreeMap<AminoAcid, AminoAcidObservation>> {
        self.rows.get(condition)
    }

    /// Iterates the observations ordered by condition and amino acid.
    pub fn iter(&self) -> impl Iterator<Item = &AminoAcidObservation> {
        self.rows.values().flat_map(|r| r.values())
    }

    /// Iterates the conditions in ascending order.
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.rows.keys()
    }

    /// Returns the distinct environments in ascending order.
    pub fn environments(&self) -> Vec<Environment> {
        let environments: BTreeSet<Environment> =
            self.rows.keys().map(|c| c.environment()).collect();
        environments.into_iter().collect()
    }

    /// Returns the distinct observed amino acids in reporting order.
    pub fn amino_acids(&self) -> Vec<AminoAcid> {
        let amino_acids: BTreeSet<AminoAcid> =
            self.rows.values().flat_map(|r| r.keys().copied()).collect();
        amino_acids.into_iter().collect()
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.rows.values().map(|r| r.len()).sum()
    }

    /// Returns true if the table holds no observation.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Display for ObservationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = |s: Option<&Statistic>| s.map_or("-".to_string(), |s| s.to_string());
        let header = format!(
            "{:<26}{:<5}{:<22}{:<22}{}",
            "Condition", "AA", "Free", "Total", "Bound"
        );
        let rows: String = self
            .iter()
            .map(|o| {
                format!(
                    "{:<26}{:<5}{:<22}{:<22}{}",
                    o.condition.to_string(),
                    o.amino_acid,
                    cell(o.concentration(Fraction::Free)),
                    cell(o.concentration(Fraction::Total)),
                    cell(o.concentration(Fraction::Bound)),
                )
            })
            .collect::<Vec<String>>()
            .join("\n");
        write!(f, "{:-^1$}\n{header}\n{rows}", " Observations ", 80)
    }
}

/// How the standard deviation of the derived bound fraction is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundVariance {
    /// Sum of the free and total variances, treating both fractions as independent.
    #[default]
    Propagated,
    /// Leave the bound standard deviation undefined.
    Undefined,
}

/// Aggregates replicate rows into per condition and amino acid statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionCalculator {
    amino_acids: Vec<AminoAcid>,
    bound_variance: BoundVariance,
}

impl Default for DistributionCalculator {
    fn default() -> Self {
        Self {
            amino_acids: AminoAcid::ALL.to_vec(),
            bound_variance: BoundVariance::default(),
        }
    }
}

impl DistributionCalculator {
    /// Creates a calculator for all amino acids with propagated bound variance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the calculator restricted to the given amino acids.
    pub fn with_amino_acids(mut self, amino_acids: Vec<AminoAcid>) -> Result<Self> {
        validate_amino_acids(&amino_acids)?;
        self.amino_acids = amino_acids;
        Ok(self)
    }

    /// Returns the calculator with the given bound variance policy.
    pub fn with_bound_variance(mut self, bound_variance: BoundVariance) -> Self {
        self.bound_variance = bound_variance;
        self
    }

    /// Aggregates the replicate rows of a table.
    ///
    /// Free and total statistics are outer joined on the condition, so a condition measured in
    /// one hydrolysate only keeps its observation with the other fraction missing. The bound
    /// fraction is derived where both exist and fails with
    /// [DataQualityError::NegativeBound] if the total mean is below the free mean.
    #[instrument(skip_all, fields(rows = table.len()))]
    pub fn compute(&self, table: &MeasurementTable) -> Result<ObservationTable> {
        let mut observations = ObservationTable::new();
        for &amino_acid in &self.amino_acids {
            let free = self.fraction_stats(table, amino_acid, SampleType::Faa);
            let total = self.fraction_stats(table, amino_acid, SampleType::Thaa);
            let conditions: BTreeSet<Condition> =
                free.keys().chain(total.keys()).copied().collect();
            for condition in conditions {
                let free = free.get(&condition).copied();
                let total = total.get(&condition).copied();
                let bound = match (&free, &total) {
                    (Some(f), Some(t)) => Some(self.bound(amino_acid, condition, f, t)?),
                    _ => None,
                };
                observations.insert(AminoAcidObservation {
                    condition,
                    amino_acid,
                    free,
                    total,
                    bound,
                });
            }
        }
        info!(
            conditions = observations.rows.len(),
            observations = observations.len(),
            "Aggregated replicate measurements."
        );
        Ok(observations)
    }

    fn fraction_stats(
        &self,
        table: &MeasurementTable,
        amino_acid: AminoAcid,
        sample_type: SampleType,
    ) -> BTreeMap<Condition, FractionStats> {
        let mut groups: BTreeMap<Condition, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
        table
            .rows()
            .iter()
            .filter(|r| r.sample_type == sample_type)
            .for_each(|r| {
                if let Some(reading) = r.reading(amino_acid) {
                    let (conc, dl) = groups.entry(r.condition).or_default();
                    conc.push(reading.concentration);
                    dl.push(reading.dl_ratio);
                }
            });
        groups
            .into_iter()
            .filter_map(|(condition, (conc, dl))| {
                let concentration = Statistic::from_samples(&conc)?;
                let dl_ratio = Statistic::from_samples(&dl);
                Some((
                    condition,
                    FractionStats {
                        concentration,
                        dl_ratio,
                    },
                ))
            })
            .collect()
    }

    fn bound(
        &self,
        amino_acid: AminoAcid,
        condition: Condition,
        free: &FractionStats,
        total: &FractionStats,
    ) -> Result<FractionStats> {
        let (f, t) = (&free.concentration, &total.concentration);
        let mean = t.mean - f.mean;
        if mean < 0. {
            return Err(DataQualityError::NegativeBound {
                amino_acid,
                condition,
                free: f.mean,
                total: t.mean,
            }
            .into());
        }
        let std = match self.bound_variance {
            BoundVariance::Propagated => match (f.variance(), t.variance()) {
                (Some(vf), Some(vt)) => Some((vf + vt).sqrt()),
                _ => None,
            },
            BoundVariance::Undefined => None,
        };
        let count = f.count.min(t.count);
        let concentration = Statistic { mean, std, count };

        let dl_ratio = match (free.dl_ratio, total.dl_ratio) {
            (Some(dl_f), Some(dl_t)) => {
                let (d_f, l_f) = enantiomers(f.mean, dl_f.mean);
                let (d_t, l_t) = enantiomers(t.mean, dl_t.mean);
                let (d_b, l_b) = (d_t - d_f, l_t - l_f);
                if d_b >= 0. && l_b > 0. {
                    Some(Statistic {
                        mean: d_b / l_b,
                        std: None,
                        count,
                    })
                } else {
                    warn!(
                        %amino_acid, %condition, d_bound = d_b, l_bound = l_b,
                        "Bound D/L ratio undefined, enantiomer balance is not positive."
                    );
                    None
                }
            }
            _ => None,
        };
        Ok(FractionStats {
            concentration,
            dl_ratio,
        })
    }
}

/// Splits a concentration with D/L ratio r into its D and L enantiomer concentrations.
pub(crate) fn enantiomers(concentration: f64, dl_ratio: f64) -> (f64, f64) {
    let l = concentration / (1. + dl_ratio);
    (concentration - l, l)
}
