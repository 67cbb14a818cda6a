pub(crate) mod config;
pub(crate) mod dimse;
pub(crate) mod relocate;
pub(crate) mod types;

use crate::config::AppConfig;
use crate::relocate::dimse::DimseServices;
use crate::relocate::orchestrator::{MoveOrchestrator, MoveResult, OrchestratorOptions, StudyMoveRequest};
use crate::relocate::progress::TracingProgressSink;
use crate::relocate::transform::TransformRules;
use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_AET: &str = "DICOM-RELOCATE";

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	// The Sentry client has to exist before the Tokio runtime is started.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let success = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			match run(config).await {
				Ok(result) => result.success,
				Err(error) => {
					error!("Failed to run relocation: {error:#}");
					false
				}
			}
		});

	if !success {
		std::process::exit(1);
	}
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<MoveResult> {
	let job = config
		.job
		.clone()
		.context("No relocation configured, add a [job] section to config.toml")?;
	for aet in [&job.source, &job.destination] {
		config
			.ae(aet)
			.with_context(|| format!("Application entity {aet} is missing in [[aets]]"))?;
	}
	let rules = TransformRules::from_config(&config.transform)?;

	let sink = Arc::new(TracingProgressSink::default());
	let orchestrator = Arc::new(MoveOrchestrator::new(
		DimseServices::new(&config),
		OrchestratorOptions::from(&config),
		sink.clone(),
	));

	let interrupt = {
		let orchestrator = Arc::clone(&orchestrator);
		tokio::spawn(async move {
			if signal::ctrl_c().await.is_err() {
				return;
			}
			warn!("Cancelling relocation, press Ctrl+C again to abort immediately");
			sink.cancel();
			if signal::ctrl_c().await.is_ok() {
				orchestrator.abort();
			}
		})
	};

	let result = orchestrator
		.relocate(StudyMoveRequest {
			study_instance_uid: job.study_instance_uid,
			source: job.source,
			destination: job.destination,
			rules,
		})
		.await?;
	interrupt.abort();

	println!("{}", serde_json::to_string_pretty(&result)?);
	Ok(result)
}
