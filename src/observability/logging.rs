use log::Level;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON logging to stdout with contextual fields.
///
/// `RUST_LOG` takes precedence over the configured level. Records emitted
/// through the `log` facade are forwarded into the same subscriber.
pub fn init_logging(level: Level) -> anyhow::Result<()> {
	let fallback = level.as_str().to_ascii_lowercase();
	let env_filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&fallback))
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let json_layer = tracing_subscriber::fmt::layer()
		.json()
		.with_current_span(true)
		.with_span_list(true)
		.with_target(true)
		.with_level(true)
		.with_thread_ids(true)
		.with_file(true)
		.with_line_number(true);

	// `try_init` also installs the `log` bridge.
	tracing_subscriber::registry()
		.with(env_filter)
		.with(json_layer)
		.try_init()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}

#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn logging_initialization() {
		// Only the first initialization in a process can succeed.
		let _ = super::init_logging(log::Level::Debug);
		assert!(super::init_logging(log::Level::Info).is_err());
	}
}
