use std::cell::{Cell, RefCell};

use rand::Rng;

use super::*;
use crate::instrument::DeviceError;
use crate::sim::{responsivity, SimulatedLab, VirtualClock};

type DevResult<T> = std::result::Result<T, DeviceError>;

struct Outcome {
    result: Result<Equalisation>,
    events: Vec<Event>,
    /// every value written to the power actuator, tagged with the point being equalised
    writes: Vec<(f64, f64)>,
    idled: bool,
}

/// Equalise `points` against a detector whose reading is `response(point, power)`.
fn run_model<R: Fn(f64, f64) -> f64>(
    settings: &EqualizerSettings,
    points: &[f64],
    response: R,
) -> Outcome {
    let point = Cell::new(f64::NAN);
    let power = Cell::new(0.0);
    let writes = RefCell::new(Vec::new());
    let idled = Cell::new(false);

    let mut point_act = |x: f64| -> DevResult<()> {
        point.set(x);
        Ok(())
    };
    let mut power_act = |x: f64| -> DevResult<()> {
        power.set(x);
        writes.borrow_mut().push((point.get(), x));
        if x == 0.0 {
            idled.set(true);
        }
        Ok(())
    };
    let mut sensor = || -> DevResult<f64> { Ok(response(point.get(), power.get())) };
    let mut events = Vec::new();
    let result = VoltageEqualizer::new(
        settings,
        &mut point_act,
        &mut power_act,
        &mut sensor,
        &mut VirtualClock::default(),
    )
    .run(points, &RunControl::new(), &mut events);
    Outcome {
        result,
        events,
        writes: writes.into_inner(),
        idled: idled.get(),
    }
}

fn settings(target: f64, threshold: f64) -> EqualizerSettings {
    let mut out = EqualizerSettings::new();
    out.target_v = target;
    out.threshold_v = threshold;
    out
}

#[test]
fn converges_on_square_root_response() {
    let k = 0.1;
    let cfg = settings(0.3, 0.005);
    let out = run_model(&cfg, &[10.0], |_, p| k * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert_eq!(eq.converged.len(), 1);
    let (point, power) = eq.converged[0];
    assert_eq!(point, 10.0);
    assert!((power - (0.3_f64 / k).powi(2)).abs() < 1e-6);
    assert_eq!(
        out.events.last(),
        Some(&Event::Converged { point: 10.0, power })
    );
    assert_eq!(eq.domain_fallbacks, 0);
}

#[test]
fn converges_for_random_gains() {
    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        let k: f64 = rng.gen_range(0.08..0.5);
        let target: f64 = rng.gen_range(0.05..(k * 17.0_f64.sqrt()));
        let cfg = settings(target, 0.002);
        let out = run_model(&cfg, &[1.0], |_, p| k * p.max(0.0).sqrt());
        let eq = out.result.unwrap();
        assert!(eq.unconverged.is_empty());
        let power = eq.converged[0].1;
        assert!((k * power.sqrt() - target).abs() <= 0.002);
        assert!(power <= 17.0);
    }
}

#[test]
fn negative_detector_converges() {
    let cfg = settings(-0.3, 0.01);
    let out = run_model(&cfg, &[10.0], |_, p| -0.1 * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert!((eq.converged[0].1 - 9.0).abs() < 1e-6);
}

#[test]
fn flat_response_falls_back_and_continues() {
    // dead below 3.5, square-law above: the first probe sees no slope at all
    let mut cfg = settings(0.3, 0.01);
    cfg.probe_step = 1.0;
    let out = run_model(&cfg, &[5.0], |_, p| {
        if p < 3.5 {
            0.05
        } else {
            0.1 * p.sqrt()
        }
    });
    let eq = out.result.unwrap();
    assert_eq!(eq.domain_fallbacks, 1);
    assert_eq!(eq.converged.len(), 1);
    assert!((eq.converged[0].1 - 9.0).abs() < 1e-6);
    assert!(out.events.contains(&Event::DomainFallback {
        point: 5.0,
        power: 3.0
    }));
    // the fallback was actually applied
    assert!(out.writes.contains(&(5.0, 3.0)));
}

#[test]
fn inverted_response_never_raises() {
    let mut cfg = settings(0.3, 0.01);
    cfg.set_max_iterations(5);
    let out = run_model(&cfg, &[5.0], |_, p| -0.1 * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert_eq!(eq.domain_fallbacks, 5);
    assert_eq!(eq.unconverged.len(), 1);
    assert_eq!(eq.unconverged[0].iterations, 5);
    assert_eq!(eq.unconverged[0].power, 3.0);
}

#[test]
fn ceiling_replaces_large_estimates() {
    // needs power 36, above the ceiling of 17
    let mut cfg = settings(0.3, 0.01);
    cfg.set_max_iterations(10);
    let out = run_model(&cfg, &[7.0], |_, p| 0.05 * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert!(eq.converged.is_empty());
    let state = eq.unconverged[0];
    assert_eq!(state.iterations, 10);
    assert_eq!(state.power, 2.0);
    let max_written = out.writes.iter().map(|w| w.1).fold(0.0, f64::max);
    assert!(max_written <= cfg.ceiling);
    assert!(out.events.contains(&Event::NotConverged {
        point: 7.0,
        power: 2.0
    }));
}

#[test]
fn half_slope_rule() {
    let est = Estimator::HalfSlope.estimate(1.0, 3.0, 0.1, 0.2, 0.3);
    assert!((est.slope - 0.1 / 6.0).abs() < 1e-12);
    assert!((est.power.unwrap() - 18.0_f64.sqrt()).abs() < 1e-9);

    let flat = Estimator::HalfSlope.estimate(1.0, 3.0, 0.1, 0.1, 0.3);
    assert_eq!(flat.power, None);
    let inverted = Estimator::HalfSlope.estimate(1.0, 3.0, 0.2, 0.1, 0.3);
    assert_eq!(inverted.power, None);
}

#[test]
fn sqrt_secant_domain() {
    assert_eq!(
        Estimator::SqrtSecant.estimate(-1.0, 3.0, 0.1, 0.2, 0.3).power,
        None
    );
    assert_eq!(
        Estimator::SqrtSecant.estimate(1.0, 3.0, 0.1, 0.1, 0.3).power,
        None
    );
    let est = Estimator::SqrtSecant.estimate(1.0, 3.0, 0.1, 0.2, 0.3);
    assert!((est.slope - 0.1).abs() < 1e-12);
    assert!((est.power.unwrap() - 9.0).abs() < 1e-9);
}

#[test]
fn seed_is_reset_for_every_point() {
    let cfg = settings(0.3, 0.005);
    let points = [8.0, 9.0, 10.0];
    let out = run_model(&cfg, &points, |f, p| 0.01 * f * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert_eq!(eq.converged.len(), 3);
    for &f in &points {
        let first = out.writes.iter().find(|w| w.0 == f).unwrap();
        assert_eq!(first.1, cfg.seed_power);
    }
    // output left at the last converged value on success
    assert_eq!(out.writes.last().unwrap().1, eq.converged[2].1);
    assert!(!out.idled);
}

#[test]
fn invalid_settings_rejected_before_actuation() {
    let mut cfg = settings(0.3, 0.0);
    let out = run_model(&cfg, &[1.0], |_, p| p);
    assert!(matches!(out.result, Err(Error::InvalidConfiguration(_))));
    assert!(out.writes.is_empty());

    cfg.threshold_v = 0.01;
    cfg.domain_fallback = 20.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn simulated_diode_across_resonances() {
    let lab = SimulatedLab::new();
    let cfg = settings(-0.3, 0.01);
    let points = [9.2, 10.0, 10.7, 12.1];
    let mut events = Vec::new();
    let eq = VoltageEqualizer::new(
        &cfg,
        &mut lab.source_frequency(),
        &mut lab.source_power(),
        &mut lab.diode(),
        &mut VirtualClock::default(),
    )
    .run(&points, &RunControl::new(), &mut events)
    .unwrap();
    assert_eq!(eq.converged.len(), points.len());
    for (f, p) in eq.converged {
        assert!((p - (0.3 / responsivity(f)).powi(2)).abs() < 1e-6);
    }
    assert!(lab.snapshot().unwrap().output);
}

#[test]
fn device_error_idles_source() {
    let lab = SimulatedLab::new();
    let cfg = settings(-0.3, 0.01);
    let mut diode = lab.diode();
    let mut reads = 0;
    let mut flaky = || -> DevResult<f64> {
        reads += 1;
        if reads > 3 {
            Err(DeviceError::new("multimeter", "timeout"))
        } else {
            diode.measure()
        }
    };
    let res = VoltageEqualizer::new(
        &cfg,
        &mut lab.source_frequency(),
        &mut lab.source_power(),
        &mut flaky,
        &mut VirtualClock::default(),
    )
    .run(&[10.0, 11.0], &RunControl::new(), &mut ());
    assert!(matches!(res, Err(Error::Device(_))));
    let state = lab.snapshot().unwrap();
    assert!(!state.output);
    assert_eq!(state.power, 0.0);
}

#[test]
fn cancellation_honours_idle_on_abort() {
    for idle_on_abort in [true, false] {
        let lab = SimulatedLab::new();
        let mut cfg = settings(-0.3, 0.01);
        cfg.idle_on_abort = idle_on_abort;
        let control = RunControl::new();
        let mut observer = |e: Event| {
            if let Event::Converged { .. } = e {
                control.cancel();
            }
        };
        let res = VoltageEqualizer::new(
            &cfg,
            &mut lab.source_frequency(),
            &mut lab.source_power(),
            &mut lab.diode(),
            &mut VirtualClock::default(),
        )
        .run(&[10.0, 11.0, 12.0], &control, &mut observer);
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(lab.snapshot().unwrap().output, !idle_on_abort);
    }
}

#[test]
fn settings_from_toml() {
    let text = r#"
        target_v = -0.25
        threshold_v = 0.02
        seed_power = 1.0
        probe_step = 3.0
        domain_fallback = 3.0
        ceiling = 17.0
        ceiling_fallback = 2.0
        settle_ms = 20.0
        max_iterations = 0
        estimator = "half_slope"
        idle_on_abort = false
    "#;
    let cfg: EqualizerSettings = toml::from_str(text).unwrap();
    assert_eq!(cfg.target_v, -0.25);
    assert_eq!(cfg.max_iterations(), None);
    assert_eq!(cfg.estimator, Estimator::HalfSlope);
    assert!((cfg.settle.as_secs_f64() - 0.020).abs() < 1e-9);

    let bad = text.replace("threshold_v = 0.02", "threshold_v = -1.0");
    assert!(toml::from_str::<EqualizerSettings>(&bad).is_err());
}

#[test]
fn commands() {
    let mut cfg = EqualizerSettings::new();
    assert_eq!(cfg.process_command("TARGET:SET:-0.25".split(':')), Ok(String::new()));
    assert_eq!(cfg.process_command("TARGET:GET".split(':')), Ok("-0.25".to_string()));
    assert_eq!(cfg.process_command("MAX_ITER:SET:0".split(':')), Ok(String::new()));
    assert_eq!(cfg.process_command("MAX_ITER:GET".split(':')), Ok("0".to_string()));
    assert_eq!(
        cfg.process_command("ESTIMATOR:SET:half_slope".split(':')),
        Ok(String::new())
    );
    assert_eq!(cfg.estimator, Estimator::HalfSlope);
    assert!(cfg.process_command("ESTIMATOR:SET:newton".split(':')).is_err());
    assert!(cfg.process_command("TARGET".split(':')).is_err());
}

fn half_slope(target: f64, threshold: f64, max_iterations: u32) -> EqualizerSettings {
    let mut out = settings(target, threshold);
    out.estimator = Estimator::HalfSlope;
    out.set_max_iterations(max_iterations);
    out
}

#[test]
fn half_slope_stalls_on_square_law() {
    // the fixed point of the rule sits near power 5.65 (0.238 V), short of the 9.0 needed
    let cfg = half_slope(0.3, 0.01, 20);
    let out = run_model(&cfg, &[10.0], |_, p| 0.1 * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert!(eq.converged.is_empty());
    assert_eq!(eq.domain_fallbacks, 0);
    let state = eq.unconverged[0];
    assert_eq!(state.iterations, 20);
    assert!((state.power - 5.648).abs() < 0.01);
    assert!(!state.within(cfg.target_v, cfg.threshold_v));
    assert_eq!(
        out.events,
        vec![Event::NotConverged {
            point: 10.0,
            power: state.power
        }]
    );
    // square-law SqrtSecant on the same detector settles in one step
    let out = run_model(&settings(0.3, 0.01), &[10.0], |_, p| 0.1 * p.max(0.0).sqrt());
    assert_eq!(out.result.unwrap().converged.len(), 1);
}

#[test]
fn half_slope_domain_fallback() {
    let cfg = half_slope(0.3, 0.01, 4);
    let out = run_model(&cfg, &[5.0], |_, p| -0.1 * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert_eq!(eq.domain_fallbacks, 4);
    assert_eq!(eq.unconverged[0].power, cfg.domain_fallback);
    let fallbacks = out
        .events
        .iter()
        .filter(|e| matches!(e, Event::DomainFallback { power, .. } if *power == 3.0))
        .count();
    assert_eq!(fallbacks, 4);
    assert_eq!(
        out.events.last(),
        Some(&Event::NotConverged {
            point: 5.0,
            power: 3.0
        })
    );
}

#[test]
fn half_slope_ceiling() {
    // sqrt(target / slope) is about 19 on the first iteration, above the ceiling
    let cfg = half_slope(0.3, 0.01, 6);
    let out = run_model(&cfg, &[7.0], |_, p| 0.005 * p.max(0.0).sqrt());
    let eq = out.result.unwrap();
    assert_eq!(eq.domain_fallbacks, 0);
    assert_eq!(eq.unconverged[0].power, cfg.ceiling_fallback);
    // seed, then probe and fallback once per iteration
    assert_eq!(out.writes.len(), 1 + 2 * 6);
    assert!(out.writes.iter().all(|w| w.1 <= cfg.ceiling));
    for pair in out.writes[1..].chunks(2) {
        assert_eq!(pair[1].1, cfg.ceiling_fallback);
    }
}

#[test]
fn circulators_follow_the_operating_point() {
    use crate::band::{BandPlan, BandSwitch};

    let lab = SimulatedLab::new();
    let cfg = settings(-0.3, 0.01);
    let plan = BandPlan::new(vec![(8.0, 12.0), (12.0, 18.0), (18.0, 26.5), (26.5, 40.0)]);
    let mut frequency = BandSwitch::new(
        plan,
        Box::new(lab.source_frequency()),
        Box::new(lab.circulator()),
    )
    .unwrap();
    let points = [10.0, 11.0, 26.3, 30.0];
    let eq = VoltageEqualizer::new(
        &cfg,
        &mut frequency,
        &mut lab.source_power(),
        &mut lab.diode(),
        &mut VirtualClock::default(),
    )
    .run(&points, &RunControl::new(), &mut ())
    .unwrap();
    assert_eq!(eq.converged.len(), points.len());
    let state = lab.snapshot().unwrap();
    // 26.3 GHz lies in the gap and keeps the previous circulator
    assert_eq!(state.switches, 2);
    assert_eq!(state.circulator, Some(3));
    assert_eq!(state.frequency_ghz, 30.0);
}
