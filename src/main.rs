mod cli;

use clap::Parser;
use cli::Cli;
use dicom_relay::config::AppConfig;
use std::process::ExitCode;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_writer(std::io::stderr)
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

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
	let cli = Cli::parse();
	let config = AppConfig::load(cli.config.as_deref())?;
	init_logger(config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let code = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			match cli.run(config).await {
				Ok(()) => ExitCode::SUCCESS,
				Err(err) => {
					error!("{err:#}");
					ExitCode::FAILURE
				}
			}
		});
	Ok(code)
}
