use aarkin::{AminoAcid, Environment, InitialState, KineticModel, Result, Simulator};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::time::Duration;

// all amino acids from pristine samples over a heating series of `size` hours
fn simulate_all(simulator: &Simulator, size: usize) -> Result<()> {
    let parameters = simulator.model().default_parameters();
    let env = Environment::new(110., 7.)?;
    let initial: Vec<(AminoAcid, InitialState)> = AminoAcid::ALL
        .iter()
        .map(|aa| (*aa, InitialState::pristine(10.)))
        .collect();
    let times: Vec<f64> = (0..=size).step_by(12).map(|t| t as f64).collect();

    // get trajectories by: let trajectories = simulator.simulate_all(...)?;
    simulator.simulate_all(&parameters, &env, &initial, &times)?;

    Ok(())
}

fn benchmark_simulate(c: &mut Criterion) {
    let Ok(model) = KineticModel::new(AminoAcid::ALL.to_vec()) else {
        return;
    };
    let simulator = Simulator::new(model);
    let mut group = c.benchmark_group("Simulate All Amino Acids");
    group.sample_size(10).warm_up_time(Duration::from_secs(1));
    for size in (240..1201).step_by(480) {
        group.bench_with_input(BenchmarkId::new("Heating hours", size), &size, |b, &s| {
            b.iter(|| simulate_all(&simulator, s));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_simulate);
criterion_main!(benches);
