use anyhow::Result;
use driftfield_core::{Ecosystem, EcosystemConfig, StepObserver, StepSummary};
use tracing::{info, warn};

const RUN_STEPS: u32 = 1_800;
const REPORT_INTERVAL: u32 = 60;

fn main() -> Result<()> {
    init_tracing();
    let mut ecosystem = bootstrap_ecosystem()?;
    info!("Starting driftfield ecosystem");
    ecosystem.run(RUN_STEPS, REPORT_INTERVAL);

    if let Some(summary) = ecosystem.history().last() {
        info!(
            step = summary.step.0,
            substrate_mean = summary.substrate_mean,
            response_mean = summary.response_mean,
            field_mean = summary.field_mean,
            manifestations = summary.manifestation_count,
            listening = ecosystem.substrate().global_listening(),
            "Run complete",
        );
    } else {
        warn!("Run completed without recording any summaries");
    }
    if let Some(latest) = ecosystem.manifestations().last() {
        info!("Latest event: {latest}");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap_ecosystem() -> Result<Ecosystem> {
    let config = EcosystemConfig {
        rng_seed: Some(0x5EED_F1E1_D001),
        history_capacity: 600,
        ..EcosystemConfig::default()
    };
    let ecosystem = Ecosystem::with_observer(config, Box::new(ReportLogger))?;
    Ok(ecosystem)
}

/// Forwards periodic summaries to the tracing pipeline.
struct ReportLogger;

impl StepObserver for ReportLogger {
    fn on_report(&mut self, summary: &StepSummary) {
        info!(
            step = summary.step.0,
            substrate_mean = summary.substrate_mean,
            response_mean = summary.response_mean,
            field_mean = summary.field_mean,
            manifestations = summary.manifestation_count,
            "Ecosystem report",
        );
    }
}
