use driftfield_core::{
    Ecosystem, EcosystemConfig, FieldConfig, PulseConfig, StepObserver, StepSummary,
    SubstrateConfig, Tick,
};
use std::sync::{Arc, Mutex};

fn quiet_config(size: usize) -> EcosystemConfig {
    EcosystemConfig {
        size,
        rng_seed: Some(0x5EED),
        pulse: PulseConfig {
            probability: 0.0,
            margin: 8,
            ..PulseConfig::default()
        },
        ..EcosystemConfig::default()
    }
}

#[test]
fn seeded_ecosystem_advances_deterministically() {
    let config = EcosystemConfig {
        size: 120,
        rng_seed: Some(0xDEAD_BEEF),
        ..EcosystemConfig::default()
    };

    let mut eco_a = Ecosystem::new(config.clone()).expect("eco_a");
    let mut eco_b = Ecosystem::new(config).expect("eco_b");

    for _ in 0..60 {
        let events_a = eco_a.step();
        let events_b = eco_b.step();
        assert_eq!(events_a, events_b);
    }

    assert_eq!(eco_a.tick(), Tick(60));
    let history_a: Vec<_> = eco_a.history().copied().collect();
    let history_b: Vec<_> = eco_b.history().copied().collect();
    assert_eq!(history_a, history_b);
    assert_eq!(eco_a.manifestations(), eco_b.manifestations());
    assert_eq!(
        eco_a.substrate().grid().cells(),
        eco_b.substrate().grid().cells()
    );
}

#[test]
fn grids_stay_bounded_over_long_runs() {
    let config = EcosystemConfig {
        size: 120,
        rng_seed: Some(42),
        ..EcosystemConfig::default()
    };
    let substrate_bounds = (config.substrate.bound_low, config.substrate.bound_high);
    let response_ceiling = config.response.ceiling;
    let field_bounds = (config.field.bound_low, config.field.bound_high);

    let mut ecosystem = Ecosystem::new(config).expect("ecosystem");
    ecosystem.run(300, 0);

    assert!(
        ecosystem
            .substrate()
            .grid()
            .cells()
            .iter()
            .all(|&v| (substrate_bounds.0..=substrate_bounds.1).contains(&v))
    );
    assert!(
        ecosystem
            .response()
            .grid()
            .cells()
            .iter()
            .all(|&v| (0.0..=response_ceiling).contains(&v))
    );
    assert!(
        ecosystem
            .field()
            .grid()
            .cells()
            .iter()
            .all(|&v| (field_bounds.0..=field_bounds.1).contains(&v))
    );

    // One summary per step, manifestation totals never regress.
    let history: Vec<_> = ecosystem.history().copied().collect();
    assert_eq!(history.last().expect("summary").step, Tick(300));
    for window in history.windows(2) {
        assert_eq!(window[1].step, window[0].step.next());
        assert!(window[1].manifestation_count >= window[0].manifestation_count);
    }
}

#[test]
fn quiet_substrate_converges_to_baseline_equilibrium() {
    let mut config = quiet_config(64);
    config.substrate = SubstrateConfig {
        initial_noise_std: 0.005,
        noise_std: 0.0,
        diffusion_sigma: 0.0,
        ..SubstrateConfig::default()
    };

    let baseline = config.substrate.baseline;
    let decay = config.substrate.decay;
    let equilibrium = baseline * decay / (1.0 - decay);

    let mut ecosystem = Ecosystem::new(config).expect("ecosystem");
    ecosystem.run(1200, 0);

    let mean = ecosystem.substrate().grid().mean();
    assert!(
        (mean - equilibrium).abs() < 1e-3,
        "substrate mean {mean} should settle near {equilibrium}"
    );

    // The equilibrium sits below the response offset, so nothing downstream
    // ever wakes up.
    assert_eq!(ecosystem.response().grid().mean(), 0.0);
    assert!(ecosystem.manifestations().is_empty());
}

#[test]
fn manifestation_feedback_ripples_into_substrate() {
    let mut config = quiet_config(96);
    config.substrate = SubstrateConfig {
        initial_noise_std: 0.0,
        baseline: 0.0,
        diffusion_sigma: 0.0,
        noise_std: 0.0,
        decay: 1.0,
        ..SubstrateConfig::default()
    };
    config.field = FieldConfig {
        initial_noise_std: 0.0,
        baseline: 0.0,
        diffusion_sigma: 0.0,
        decay: 1.0,
        emission_prob_cap: 1.0,
        ..FieldConfig::default()
    };

    let field_config = config.field;
    let ripple_amplitude = config.ripple_amplitude;
    let ripple_scale = config.ripple_scale;

    let mut ecosystem = Ecosystem::new(config).expect("ecosystem");
    *ecosystem
        .field_mut()
        .grid_mut()
        .get_mut(48, 48)
        .expect("cell") = 0.95;

    let events = ecosystem.step();
    assert!(!events.pulsed);
    assert_eq!(events.manifested, 1);

    let manifestations = ecosystem.manifestations();
    assert_eq!(manifestations.len(), 1);
    let event = manifestations[0];
    assert_eq!(event.sequence_id, 0);
    assert_eq!((event.row, event.col), (48, 48));

    // Probability capped at 1.0, so the strength is exactly the gain.
    let strength = field_config.strength_gain;
    assert!((event.strength - strength).abs() < 1e-7);
    let released = 0.95 - field_config.release_fraction * strength;
    let field_value = ecosystem.field().grid().get(48, 48).expect("cell");
    assert!((field_value - released).abs() < 1e-6);

    // The ripple is the only write into an otherwise inert substrate.
    let center = ecosystem.substrate().grid().get(48, 48).expect("cell");
    assert!((center - ripple_amplitude).abs() < 1e-6);

    let at_five = ecosystem.substrate().grid().get(53, 48).expect("cell");
    let expected = ripple_amplitude * (-5.0_f32 / ripple_scale).exp();
    assert!((at_five - expected).abs() < 1e-6);

    let at_radius = ecosystem.substrate().grid().get(48, 66).expect("cell");
    assert_eq!(at_radius, 0.0, "cells at the ripple radius receive nothing");
    assert_eq!(ecosystem.substrate().grid().get(0, 0), Some(0.0));

    let summary = ecosystem.history().last().expect("summary");
    assert_eq!(summary.manifestation_count, 1);
}

#[derive(Default)]
struct RecordingObserver {
    log: Arc<Mutex<Vec<StepSummary>>>,
}

impl StepObserver for RecordingObserver {
    fn on_report(&mut self, summary: &StepSummary) {
        self.log.lock().expect("log lock").push(*summary);
    }
}

#[test]
fn observer_receives_reports_at_cadence() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let observer = RecordingObserver {
        log: Arc::clone(&log),
    };
    let mut ecosystem =
        Ecosystem::with_observer(quiet_config(96), Box::new(observer)).expect("ecosystem");

    ecosystem.run(100, 10);

    let reports = log.lock().expect("log lock");
    assert_eq!(reports.len(), 10);
    for (index, summary) in reports.iter().enumerate() {
        assert_eq!(summary.step, Tick((index as u64 + 1) * 10));
    }
}

#[test]
fn constant_pulses_light_up_the_substrate() {
    let config = EcosystemConfig {
        size: 120,
        rng_seed: Some(99),
        pulse: PulseConfig {
            probability: 1.0,
            ..PulseConfig::default()
        },
        ..EcosystemConfig::default()
    };
    let mut ecosystem = Ecosystem::new(config).expect("ecosystem");

    let mut pulsed_steps = 0;
    for _ in 0..400 {
        if ecosystem.step().pulsed {
            pulsed_steps += 1;
        }
    }
    assert_eq!(pulsed_steps, 400);

    // The baseline alone settles the substrate just above the activity
    // threshold; pulses only push further.
    assert!(ecosystem.substrate().global_listening() > 0.2);
}

#[test]
fn free_running_preset_carries_stronger_constants() {
    let coupled = SubstrateConfig::default();
    let solo = SubstrateConfig::free_running();
    assert!(solo.baseline > coupled.baseline);
    assert!(solo.noise_std > coupled.noise_std);
    assert!(solo.perturbation_threshold > coupled.perturbation_threshold);
    assert!(solo.bound_high > coupled.bound_high);
}
