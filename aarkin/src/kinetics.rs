use crate::{
    AminoAcid, AminoAcidObservation, ConfigurationError, DataQualityError, Environment, Fraction,
    KELVIN_OFFSET, Result, amino_acid::validate_amino_acids, distribution::enantiomers,
};
use nalgebra::DVector;
use num_dual::DualNum;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Molar gas constant in kJ/(mol K).
pub const GAS_CONSTANT: f64 = 8.314_462_618e-3;

/// Activation energies are optimized in units of 10 kJ/mol.
const ACTIVATION_UNIT: f64 = 10.;
const RATE_RANGE: (f64, f64) = (1e-12, 1e2);
const ACTIVATION_RANGE: (f64, f64) = (1., 400.);

/// Named entry of a [ParameterVector].
///
/// Rate constants are given in 1/h at the reference temperature and pH of the model, activation
/// energies in kJ/mol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterKind {
    /// Hydrolysis rate of peptide bonds, shared by all amino acids.
    HydrolysisRate,
    /// Activation energy of hydrolysis.
    HydrolysisActivation,
    /// Forward racemization rate (L to D) of the peptide-bound pool.
    BoundRacemizationRate(AminoAcid),
    /// Forward racemization rate (L to D) of the free pool.
    FreeRacemizationRate(AminoAcid),
    /// Activation energy of racemization in both pools.
    RacemizationActivation(AminoAcid),
}

impl ParameterKind {
    /// Returns true for rate constants.
    pub fn is_rate(&self) -> bool {
        matches!(
            self,
            ParameterKind::HydrolysisRate
                | ParameterKind::BoundRacemizationRate(_)
                | ParameterKind::FreeRacemizationRate(_)
        )
    }

    /// Amino acid the parameter belongs to, none for shared parameters.
    pub fn amino_acid(&self) -> Option<AminoAcid> {
        match self {
            ParameterKind::HydrolysisRate | ParameterKind::HydrolysisActivation => None,
            ParameterKind::BoundRacemizationRate(aa)
            | ParameterKind::FreeRacemizationRate(aa)
            | ParameterKind::RacemizationActivation(aa) => Some(*aa),
        }
    }

    /// Maps a physical value onto its optimizer coordinate.
    ///
    /// Rates are mapped to their natural logarithm, activation energies are rescaled.
    pub fn to_coordinate(&self, value: f64) -> f64 {
        if self.is_rate() {
            value.ln()
        } else {
            value / ACTIVATION_UNIT
        }
    }

    /// Maps an optimizer coordinate back onto the physical value.
    pub fn from_coordinate<D: DualNum<f64>>(&self, x: D) -> D {
        if self.is_rate() {
            x.exp()
        } else {
            x * ACTIVATION_UNIT
        }
    }

    /// Lower and upper bound of the optimizer coordinate.
    pub fn coordinate_bounds(&self) -> (f64, f64) {
        let (lower, upper) = if self.is_rate() {
            RATE_RANGE
        } else {
            ACTIVATION_RANGE
        };
        (self.to_coordinate(lower), self.to_coordinate(upper))
    }
}

impl Display for ParameterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParameterKind::HydrolysisRate => "k_hyd".to_string(),
            ParameterKind::HydrolysisActivation => "Ea_hyd".to_string(),
            ParameterKind::BoundRacemizationRate(aa) => format!("k_rac_bound[{aa}]"),
            ParameterKind::FreeRacemizationRate(aa) => format!("k_rac_free[{aa}]"),
            ParameterKind::RacemizationActivation(aa) => format!("Ea_rac[{aa}]"),
        };
        f.pad(&name)
    }
}

/// Ordered, named kinetic parameters following the layout of a [KineticModel].
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterVector {
    kinds: Vec<ParameterKind>,
    values: DVector<f64>,
}

impl ParameterVector {
    /// Layout of the vector.
    pub fn kinds(&self) -> &[ParameterKind] {
        &self.kinds
    }

    /// Physical values in layout order.
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if the vector holds no parameter.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Returns the value of a parameter.
    pub fn get(&self, kind: ParameterKind) -> Option<f64> {
        self.position(kind).map(|idx| self.values[idx])
    }

    /// Returns the vector with a replaced parameter value.
    pub fn with_value(mut self, kind: ParameterKind, value: f64) -> Result<Self> {
        let idx = self
            .position(kind)
            .ok_or_else(|| ConfigurationError::UnknownParameter(kind.to_string()))?;
        validate_value(kind, value)?;
        self.values[idx] = value;
        Ok(self)
    }

    /// Iterates the parameters with their values.
    pub fn iter(&self) -> impl Iterator<Item = (ParameterKind, f64)> + '_ {
        self.kinds.iter().copied().zip(self.values.iter().copied())
    }

    fn position(&self, kind: ParameterKind) -> Option<usize> {
        self.kinds.iter().position(|k| *k == kind)
    }
}

impl Display for ParameterVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self
            .iter()
            .map(|(kind, value)| format!("{kind:<16}{value:>12.6e}"))
            .collect::<Vec<String>>()
            .join("\n");
        write!(f, "{rows}")
    }
}

fn validate_value(kind: ParameterKind, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0. {
        return Err(ConfigurationError::InvalidParameter {
            parameter: kind.to_string(),
            value,
        }
        .into());
    }
    Ok(())
}

/// Reversibility of the racemization reaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Racemization {
    /// L and D interconvert, the backward rate is the forward rate divided by the equilibrium D/L
    /// ratio.
    Reversible {
        /// D/L ratio at equilibrium.
        equilibrium_ratio: f64,
    },
    /// Only L converts into D. The D/L ratio rises monotonically, a simulated ratio above 1 is
    /// implausible.
    Irreversible,
}

impl Default for Racemization {
    fn default() -> Self {
        Racemization::Reversible {
            equilibrium_ratio: 1.,
        }
    }
}

impl Racemization {
    /// Equilibrium D/L ratio, none if irreversible.
    pub fn equilibrium_ratio(&self) -> Option<f64> {
        match self {
            Racemization::Reversible { equilibrium_ratio } => Some(*equilibrium_ratio),
            Racemization::Irreversible => None,
        }
    }

    /// Largest D/L ratio a simulation may reach: the equilibrium ratio if reversible, 1 otherwise.
    pub fn ratio_limit(&self) -> f64 {
        self.equilibrium_ratio().unwrap_or(1.)
    }
}

/// Configuration of the [KineticModel].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Reference temperature of the rate constants in °C.
    pub reference_temperature: f64,
    /// Reversibility of racemization.
    pub racemization: Racemization,
    /// Change of log10 rates per pH unit.
    pub ph_sensitivity: f64,
    /// Reference pH of the rate constants.
    pub reference_ph: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            reference_temperature: 60.,
            racemization: Racemization::default(),
            ph_sensitivity: 0.,
            reference_ph: 7.,
        }
    }
}

impl ModelConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.reference_temperature.is_finite()
            || self.reference_temperature + KELVIN_OFFSET <= 0.
        {
            return Err(ConfigurationError::InvalidOption {
                option: "reference_temperature",
                value: self.reference_temperature,
                requirement: "above absolute zero",
            }
            .into());
        }
        if let Some(ratio) = self.racemization.equilibrium_ratio() {
            if !ratio.is_finite() || ratio <= 0. {
                return Err(ConfigurationError::InvalidOption {
                    option: "equilibrium_ratio",
                    value: ratio,
                    requirement: "> 0",
                }
                .into());
            }
        }
        if !self.ph_sensitivity.is_finite() {
            return Err(ConfigurationError::InvalidOption {
                option: "ph_sensitivity",
                value: self.ph_sensitivity,
                requirement: "finite",
            }
            .into());
        }
        if !self.reference_ph.is_finite() || !(0. ..=14.).contains(&self.reference_ph) {
            return Err(ConfigurationError::InvalidOption {
                option: "reference_ph",
                value: self.reference_ph,
                requirement: "within [0, 14]",
            }
            .into());
        }
        Ok(())
    }
}

/// Enantiomer concentrations of the bound and free pool of an amino acid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolState<D> {
    /// L enantiomer, peptide-bound.
    pub bound_l: D,
    /// D enantiomer, peptide-bound.
    pub bound_d: D,
    /// L enantiomer, free.
    pub free_l: D,
    /// D enantiomer, free.
    pub free_d: D,
}

impl<D: DualNum<f64> + Copy> PoolState<D> {
    pub(crate) fn from_array(y: [D; 4]) -> Self {
        Self {
            bound_l: y[0],
            bound_d: y[1],
            free_l: y[2],
            free_d: y[3],
        }
    }

    pub(crate) fn to_array(self) -> [D; 4] {
        [self.bound_l, self.bound_d, self.free_l, self.free_d]
    }

    /// Sum of all pools.
    pub fn total(&self) -> D {
        self.bound_l + self.bound_d + self.free_l + self.free_d
    }

    /// Enantiomer concentrations (D, L) of a fraction.
    pub fn enantiomers(&self, fraction: Fraction) -> (D, D) {
        match fraction {
            Fraction::Free => (self.free_d, self.free_l),
            Fraction::Bound => (self.bound_d, self.bound_l),
            Fraction::Total => (self.free_d + self.bound_d, self.free_l + self.bound_l),
        }
    }

    /// Concentration of a fraction.
    pub fn concentration(&self, fraction: Fraction) -> D {
        let (d, l) = self.enantiomers(fraction);
        d + l
    }

    /// D/L ratio of a fraction, none if the fraction holds no L enantiomer.
    pub fn dl_ratio(&self, fraction: Fraction) -> Option<D> {
        let (d, l) = self.enantiomers(fraction);
        if l.re() > 0. {
            Some(d / l)
        } else {
            None
        }
    }
}

/// State of an amino acid at the simulation origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialState {
    /// Peptide-bound concentration.
    pub bound: f64,
    /// Free concentration.
    pub free: f64,
    /// D/L ratio of the bound pool.
    pub bound_dl: f64,
    /// D/L ratio of the free pool.
    pub free_dl: f64,
}

impl InitialState {
    /// Creates a validated initial state.
    pub fn new(bound: f64, free: f64, bound_dl: f64, free_dl: f64) -> Result<Self> {
        let fields = [
            ("bound", bound),
            ("free", free),
            ("bound_dl", bound_dl),
            ("free_dl", free_dl),
        ];
        for (field, value) in fields {
            if !value.is_finite() || value < 0. {
                return Err(DataQualityError::InvalidCondition { field, value }.into());
            }
        }
        Ok(Self {
            bound,
            free,
            bound_dl,
            free_dl,
        })
    }

    /// Unheated protein: all amino acids peptide-bound and pure L.
    pub fn pristine(bound: f64) -> Self {
        Self {
            bound,
            free: 0.,
            bound_dl: 0.,
            free_dl: 0.,
        }
    }

    /// Seeds the state from an observation.
    ///
    /// The total fraction is required. Without a free fraction all of it is taken as bound;
    /// a bound D/L that could not be derived falls back to the total D/L.
    pub fn from_observation(observation: &AminoAcidObservation) -> Result<Self> {
        let total = observation
            .total
            .ok_or(DataQualityError::MissingInitialState {
                amino_acid: observation.amino_acid,
                environment: observation.condition.environment(),
            })?;
        let total_dl = total.dl_ratio.map_or(0., |s| s.mean);
        match (observation.free, observation.bound) {
            (Some(free), Some(bound)) => Self::new(
                bound.concentration.mean,
                free.concentration.mean,
                bound.dl_ratio.map_or(total_dl, |s| s.mean),
                free.dl_ratio.map_or(0., |s| s.mean),
            ),
            _ => Self::new(total.concentration.mean, 0., total_dl, 0.),
        }
    }

    /// Enantiomer pools of the state.
    pub fn state<D: DualNum<f64> + Copy>(&self) -> PoolState<D> {
        let (bound_d, bound_l) = enantiomers(self.bound, self.bound_dl);
        let (free_d, free_l) = enantiomers(self.free, self.free_dl);
        PoolState {
            bound_l: D::from(bound_l),
            bound_d: D::from(bound_d),
            free_l: D::from(free_l),
            free_d: D::from(free_d),
        }
    }
}

/// First order rate constants of one amino acid in one environment, in 1/h.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateConstants<D> {
    /// Hydrolysis of the bound pool into the free pool.
    pub hydrolysis: D,
    /// L to D in the bound pool.
    pub bound_forward: D,
    /// D to L in the bound pool.
    pub bound_backward: D,
    /// L to D in the free pool.
    pub free_forward: D,
    /// D to L in the free pool.
    pub free_backward: D,
}

impl<D: DualNum<f64> + Copy> RateConstants<D> {
    /// Time derivative of the pools.
    ///
    /// Hydrolysis moves both bound enantiomers into the free pool, racemization interconverts
    /// the enantiomers within each pool.
    pub fn derivative(&self, y: &PoolState<D>) -> PoolState<D> {
        let kh = self.hydrolysis;
        let (kbf, kbb) = (self.bound_forward, self.bound_backward);
        let (kff, kfb) = (self.free_forward, self.free_backward);
        PoolState {
            bound_l: kbb * y.bound_d - (kh + kbf) * y.bound_l,
            bound_d: kbf * y.bound_l - (kh + kbb) * y.bound_d,
            free_l: kh * y.bound_l + kfb * y.free_d - kff * y.free_l,
            free_d: kh * y.bound_d + kff * y.free_l - kfb * y.free_d,
        }
    }
}

#[cfg_attr(doc, katexit::katexit)]
/// Rate constant at temperature $T$ and pH following the Arrhenius relation
///
/// $k(T, pH) = k_{ref} \exp\left(-\frac{E_a}{R}\left(\frac 1 T - \frac 1 {T_{ref}}\right)\right)
/// 10^{\beta (pH - pH_{ref})}$
pub fn arrhenius<D: DualNum<f64> + Copy>(
    rate: D,
    activation: D,
    temperature: f64,
    reference_temperature: f64,
    ph_factor: f64,
) -> D {
    let exponent = -(1. / temperature - 1. / reference_temperature) / GAS_CONSTANT;
    rate * (activation * exponent).exp() * ph_factor
}

/// Hydrolysis and racemization model of a fixed list of amino acids.
///
/// The parameter layout is `k_hyd`, `Ea_hyd` followed by `k_rac_bound`, `k_rac_free` and `Ea_rac`
/// for each amino acid in list order. The pools of different amino acids are decoupled, they only
/// share the hydrolysis parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct KineticModel {
    amino_acids: Vec<AminoAcid>,
    config: ModelConfig,
    layout: Vec<ParameterKind>,
}

impl KineticModel {
    /// Creates the model with the default [ModelConfig].
    pub fn new(amino_acids: Vec<AminoAcid>) -> Result<Self> {
        validate_amino_acids(&amino_acids)?;
        let mut layout = vec![
            ParameterKind::HydrolysisRate,
            ParameterKind::HydrolysisActivation,
        ];
        amino_acids.iter().for_each(|&aa| {
            layout.push(ParameterKind::BoundRacemizationRate(aa));
            layout.push(ParameterKind::FreeRacemizationRate(aa));
            layout.push(ParameterKind::RacemizationActivation(aa));
        });
        Ok(Self {
            amino_acids,
            config: ModelConfig::default(),
            layout,
        })
    }

    /// Returns the model with the given configuration.
    pub fn with_config(mut self, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Modelled amino acids.
    pub fn amino_acids(&self) -> &[AminoAcid] {
        &self.amino_acids
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Parameter layout.
    pub fn layout(&self) -> &[ParameterKind] {
        &self.layout
    }

    /// Creates a parameter vector from physical values in layout order.
    pub fn parameters(&self, values: Vec<f64>) -> Result<ParameterVector> {
        if values.len() != self.layout.len() {
            return Err(ConfigurationError::ParameterLength {
                expected: self.layout.len(),
                found: values.len(),
            }
            .into());
        }
        for (kind, value) in self.layout.iter().zip(&values) {
            validate_value(*kind, *value)?;
        }
        Ok(ParameterVector {
            kinds: self.layout.clone(),
            values: DVector::from_vec(values),
        })
    }

    /// Heuristic seed of the parameters.
    pub fn default_parameters(&self) -> ParameterVector {
        let values = self
            .layout
            .iter()
            .map(|kind| match kind {
                ParameterKind::HydrolysisRate => 1e-3,
                ParameterKind::HydrolysisActivation => 100.,
                ParameterKind::BoundRacemizationRate(aa) => default_racemization(*aa).0,
                ParameterKind::FreeRacemizationRate(aa) => default_racemization(*aa).1,
                ParameterKind::RacemizationActivation(aa) => default_racemization(*aa).2,
            })
            .collect();
        ParameterVector {
            kinds: self.layout.clone(),
            values: DVector::from_vec(values),
        }
    }

    /// Maps parameters onto optimizer coordinates.
    pub fn to_coordinates(&self, parameters: &ParameterVector) -> Result<DVector<f64>> {
        self.check_layout(parameters)?;
        let mut x = DVector::zeros(parameters.len());
        for (idx, (kind, value)) in parameters.iter().enumerate() {
            if kind.is_rate() && value <= 0. {
                return Err(ConfigurationError::NonPositiveRate {
                    parameter: kind.to_string(),
                    value,
                }
                .into());
            }
            x[idx] = kind.to_coordinate(value);
        }
        Ok(x)
    }

    /// Maps optimizer coordinates back onto parameters.
    pub fn from_coordinates(&self, x: &DVector<f64>) -> Result<ParameterVector> {
        if x.len() != self.layout.len() {
            return Err(ConfigurationError::ParameterLength {
                expected: self.layout.len(),
                found: x.len(),
            }
            .into());
        }
        let values = self
            .layout
            .iter()
            .zip(x.iter())
            .map(|(kind, &c)| kind.from_coordinate(c))
            .collect();
        self.parameters(values)
    }

    /// Lower and upper coordinate bounds in layout order.
    pub fn coordinate_bounds(&self) -> (DVector<f64>, DVector<f64>) {
        let (lower, upper): (Vec<f64>, Vec<f64>) =
            self.layout.iter().map(|k| k.coordinate_bounds()).unzip();
        (DVector::from_vec(lower), DVector::from_vec(upper))
    }

    /// Indices of the five parameters an amino acid depends on: `k_hyd`, `Ea_hyd`,
    /// `k_rac_bound`, `k_rac_free` and `Ea_rac`.
    pub fn parameter_indices(&self, amino_acid: AminoAcid) -> Option<[usize; 5]> {
        let i = self.amino_acids.iter().position(|aa| *aa == amino_acid)?;
        Some([0, 1, 2 + 3 * i, 3 + 3 * i, 4 + 3 * i])
    }

    /// Rate constants in an environment from the five parameters of an amino acid, ordered as
    /// in [KineticModel::parameter_indices].
    pub fn rate_constants<D: DualNum<f64> + Copy>(
        &self,
        values: &[D; 5],
        environment: &Environment,
    ) -> RateConstants<D> {
        let t = environment.temperature_kelvin();
        let t_ref = self.config.reference_temperature + KELVIN_OFFSET;
        let ph_factor =
            10f64.powf(self.config.ph_sensitivity * (environment.ph() - self.config.reference_ph));
        let [k_hyd, ea_hyd, k_bound, k_free, ea_rac] = *values;
        let hydrolysis = arrhenius(k_hyd, ea_hyd, t, t_ref, ph_factor);
        let bound_forward = arrhenius(k_bound, ea_rac, t, t_ref, ph_factor);
        let free_forward = arrhenius(k_free, ea_rac, t, t_ref, ph_factor);
        let (bound_backward, free_backward) = match self.config.racemization {
            Racemization::Reversible { equilibrium_ratio } => (
                bound_forward * (1. / equilibrium_ratio),
                free_forward * (1. / equilibrium_ratio),
            ),
            Racemization::Irreversible => (D::from(0.), D::from(0.)),
        };
        RateConstants {
            hydrolysis,
            bound_forward,
            bound_backward,
            free_forward,
            free_backward,
        }
    }

    /// Instantaneous time derivative of the pools, see [RateConstants::derivative].
    pub fn derivative<D: DualNum<f64> + Copy>(
        &self,
        state: &PoolState<D>,
        rates: &RateConstants<D>,
    ) -> PoolState<D> {
        rates.derivative(state)
    }

    fn check_layout(&self, parameters: &ParameterVector) -> Result<()> {
        if parameters.kinds != self.layout {
            return Err(ConfigurationError::ParameterLength {
                expected: self.layout.len(),
                found: parameters.len(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn physical_values(&self, parameters: &ParameterVector) -> Result<Vec<f64>> {
        self.check_layout(parameters)?;
        Ok(parameters.values.iter().copied().collect())
    }
}

// bound rate, free rate (1/h at 60 °C) and activation energy (kJ/mol)
fn default_racemization(amino_acid: AminoAcid) -> (f64, f64, f64) {
    match amino_acid {
        AminoAcid::Asx => (5e-3, 1e-3, 110.),
        AminoAcid::Ser => (4e-3, 8e-4, 110.),
        AminoAcid::Ala => (2e-3, 4e-4, 120.),
        AminoAcid::Phe => (1.5e-3, 3e-4, 120.),
        AminoAcid::Glx => (1e-3, 2e-4, 120.),
        AminoAcid::Val | AminoAcid::Ile => (5e-4, 1e-4, 130.),
    }
}
