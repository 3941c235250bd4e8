use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;

use labsweep::control::RunControl;
use labsweep::equalizer::{EqualizerSettings, VoltageEqualizer};
use labsweep::instrument::DeviceError;
use labsweep::maxima::LocalMaximaPicker;
use labsweep::ramp::RampSetup;
use labsweep::sim::{SimulatedLab, VirtualClock};

pub fn ramp(c: &mut Criterion) {
    let mut setup = RampSetup::new();
    setup.max_rate_per_step(100.0).oversample(10);
    c.bench_function("ramp setpoints 0 -> 2000", |b| {
        b.iter(|| setup.setpoints(black_box(0.0), black_box(2000.0)))
    });
    c.bench_function("ramp drive 0 -> 2000", |b| {
        b.iter(|| {
            let mut sink = |x: f64| -> Result<(), DeviceError> {
                black_box(x);
                Ok(())
            };
            setup.drive(
                0.0,
                2000.0,
                &mut sink,
                &mut VirtualClock::default(),
                &RunControl::new(),
                &mut (),
            )
        })
    });
}

pub fn maxima(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let scan: Vec<f64> = (0..60_000).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let picker = LocalMaximaPicker::new(8).unwrap();
    c.bench_function("local maxima 60k order 8", |b| {
        b.iter(|| picker.indices(black_box(&scan)))
    });
}

pub fn equalise(c: &mut Criterion) {
    let lab = SimulatedLab::new();
    let settings = EqualizerSettings::new();
    let points: Vec<f64> = (0..100).map(|i| 9.0 + 0.05 * f64::from(i)).collect();
    c.bench_function("equalise 100 simulated points", |b| {
        b.iter(|| {
            VoltageEqualizer::new(
                &settings,
                &mut lab.source_frequency(),
                &mut lab.source_power(),
                &mut lab.diode(),
                &mut VirtualClock::default(),
            )
            .run(black_box(&points), &RunControl::new(), &mut ())
        })
    });
}

criterion_group!(benches, ramp, maxima, equalise);
criterion_main!(benches);
