use anyhow::{Context, Result};
use tracing::info;

use tc_checker::report::{report, FileSink, StdoutSink, VerdictSink};
use tc_checker::{Checker, CheckerConfig};

const VERDICT_PATH_ENV: &str = "CHECKER_VERDICT_PATH";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tc_checker=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = CheckerConfig::load().context("Failed to load checker configuration")?;
    info!(
        "Checking {:?} (expected: {:?}, jail: {:?})",
        config.target, config.layout.expected_root, config.jail.root
    );

    let verdict = Checker::new(config)
        .check()
        .await
        .context("Failed to assemble verdict")?;

    let sink: Box<dyn VerdictSink> = match std::env::var(VERDICT_PATH_ENV) {
        Ok(path) => Box::new(FileSink::new(path)),
        Err(_) => Box::new(StdoutSink),
    };
    report(verdict, sink.as_ref()).await
}
