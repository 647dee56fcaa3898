use aarkin::{Fraction, FitConfig, KineticFit, MeasurementTable, Result};
use tracing_subscriber::{EnvFilter, fmt};

const DATA: &str = include_str!("../../data/heating_series.csv");

const CONFIG: &str = r#"
amino_acids = ["Asx", "Ala"]
bound_variance = "propagated"

[model]
reference_temperature = 60.0
racemization = { kind = "reversible", equilibrium_ratio = 1.0 }

[integrator]
rtol = 1e-8
atol = 1e-10

[loss]
fractions = ["free", "total"]
dl_weight = 10.0
weighting = { kind = "inverse_variance", concentration_std_floor = 0.05, dl_std_floor = 0.002 }

[optimizer]
learning_rate = 0.05
learning_rate_decay = { kind = "inverse_time", rate = 0.01 }
max_iterations = 200
patience = 30
timeout_seconds = 60.0
"#;

// run with RUST_LOG=aarkin=debug to follow the optimizer
fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FitConfig::from_toml_str(CONFIG)?;
    let table = MeasurementTable::from_csv_reader(DATA.as_bytes())?;
    let observations = config.observations(&table)?;
    println!("{observations}\n");

    let fit = KineticFit::from_config(&config, observations)?;
    let result = fit.solve()?;
    println!("{result}\n");

    // largest weighted residuals
    let mut residuals = fit.residuals(&result.parameters)?;
    residuals.sort_by(|a, b| {
        let wa = a.weight.sqrt() * a.value().abs();
        let wb = b.weight.sqrt() * b.value().abs();
        wb.total_cmp(&wa)
    });
    for r in residuals.iter().take(5) {
        println!(
            "{} {} {} {:?}: observed {:.4}, simulated {:.4}",
            r.condition, r.amino_acid, r.fraction, r.channel, r.observed, r.simulated
        );
    }
    println!();

    // fitted curves for plotting
    let times: Vec<f64> = (0..=21).map(|i| 24. * i as f64).collect();
    for trajectory in fit.trajectories(&result.parameters, &times)? {
        let dl: Vec<String> = trajectory
            .series(Fraction::Total)
            .iter()
            .map(|p| format!("{:.3}", p.dl_ratio.unwrap_or(0.)))
            .collect();
        println!(
            "{} {}: {}",
            trajectory.amino_acid(),
            trajectory.environment(),
            dl.join(" ")
        );
    }

    Ok(())
}
