use crate::{DataQualityError, Result};
use std::{cmp::Ordering, fmt::Display};

/// Offset between degree Celsius and Kelvin.
pub const KELVIN_OFFSET: f64 = 273.15;

/// Isothermal incubation setting: temperature and pH.
///
/// The temperature is stored in Kelvin, while constructors and accessors for degree Celsius are
/// provided since experiments are reported in °C.
#[derive(Debug, Clone, Copy)]
pub struct Environment {
    temperature: f64,
    ph: f64,
}

impl Environment {
    /// Creates an environment from a temperature in °C and a pH value.
    pub fn new(temperature_celsius: f64, ph: f64) -> Result<Self> {
        Self::from_kelvin(temperature_celsius + KELVIN_OFFSET, ph)
    }

    /// Creates an environment from a temperature in Kelvin and a pH value.
    pub fn from_kelvin(temperature: f64, ph: f64) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0. {
            return Err(DataQualityError::InvalidCondition {
                field: "temperature",
                value: temperature,
            }
            .into());
        }
        if !ph.is_finite() || !(0. ..=14.).contains(&ph) {
            return Err(DataQualityError::InvalidCondition {
                field: "ph",
                value: ph,
            }
            .into());
        }
        Ok(Self { temperature, ph })
    }

    /// Temperature in Kelvin.
    pub fn temperature_kelvin(&self) -> f64 {
        self.temperature
    }

    /// Temperature in °C.
    pub fn temperature_celsius(&self) -> f64 {
        self.temperature - KELVIN_OFFSET
    }

    /// pH value.
    pub fn ph(&self) -> f64 {
        self.ph
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Environment {}

impl PartialOrd for Environment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Environment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.temperature
            .total_cmp(&other.temperature)
            .then(self.ph.total_cmp(&other.ph))
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1} °C, pH {:.2}", self.temperature_celsius(), self.ph)
    }
}

/// Experimental setting of a measurement: environment and heating time in hours.
///
/// Conditions are totally ordered by temperature, pH and time, which is the row order of all
/// observation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Condition {
    environment: Environment,
    time: HeatingTime,
}

/// Heating time in hours, totally ordered.
#[derive(Debug, Clone, Copy)]
struct HeatingTime(f64);

impl PartialEq for HeatingTime {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for HeatingTime {}

impl PartialOrd for HeatingTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeatingTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Condition {
    /// Creates a condition from temperature in °C, pH and time in hours.
    pub fn new(temperature_celsius: f64, ph: f64, time: f64) -> Result<Self> {
        Self::from_environment(Environment::new(temperature_celsius, ph)?, time)
    }

    /// Creates a condition at the given time within an environment.
    pub fn from_environment(environment: Environment, time: f64) -> Result<Self> {
        if !time.is_finite() || time < 0. {
            return Err(DataQualityError::InvalidCondition {
                field: "time",
                value: time,
            }
            .into());
        }
        // -0 and 0 are distinct under total_cmp
        Ok(Self {
            environment,
            time: HeatingTime(time + 0.),
        })
    }

    /// Environment of the condition.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Heating time in hours.
    pub fn time(&self) -> f64 {
        self.time.0
    }

    /// Temperature in Kelvin.
    pub fn temperature_kelvin(&self) -> f64 {
        self.environment.temperature_kelvin()
    }

    /// Temperature in °C.
    pub fn temperature_celsius(&self) -> f64 {
        self.environment.temperature_celsius()
    }

    /// pH value.
    pub fn ph(&self) -> f64 {
        self.environment.ph()
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {:.1} h", self.environment, self.time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn environment_kelvin() -> Result<()> {
        let env = Environment::new(50., 8.)?;
        assert!((env.temperature_kelvin() - 323.15).abs() < 1e-12);
        assert!((env.temperature_celsius() - 50.).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn environment_invalid() {
        assert_eq!(
            Environment::new(-300., 7.),
            Err(Error::DataQuality(DataQualityError::InvalidCondition {
                field: "temperature",
                value: -300. + KELVIN_OFFSET,
            }))
        );
        assert_eq!(
            Environment::new(50., 15.),
            Err(Error::DataQuality(DataQualityError::InvalidCondition {
                field: "ph",
                value: 15.,
            }))
        );
    }

    #[test]
    fn condition_order() -> Result<()> {
        let mut conditions = vec![
            Condition::new(80., 7., 24.)?,
            Condition::new(50., 8., 48.)?,
            Condition::new(50., 8., 0.)?,
            Condition::new(50., 7., 100.)?,
        ];
        conditions.sort();
        let times: Vec<f64> = conditions.iter().map(|c| c.time()).collect();
        assert_eq!(times, vec![100., 0., 48., 24.]);
        Ok(())
    }

    #[test]
    fn condition_negative_time() {
        assert_eq!(
            Condition::new(50., 8., -1.),
            Err(Error::DataQuality(DataQualityError::InvalidCondition {
                field: "time",
                value: -1.,
            }))
        );
    }

    #[test]
    fn condition_negative_zero_time() -> Result<()> {
        let zero = Condition::new(50., 8., 0.)?;
        let negative_zero = Condition::new(50., 8., -0.)?;
        assert_eq!(zero, negative_zero);
        assert!(negative_zero.time().is_sign_positive());
        Ok(())
    }

    #[test]
    fn condition_display() -> Result<()> {
        let c = Condition::new(50., 8., 24.)?;
        assert_eq!(c.to_string(), "50.0 °C, pH 8.00, 24.0 h");
        Ok(())
    }
}
