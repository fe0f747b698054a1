pub mod config;
pub mod reporter;
pub mod scheduler;
pub mod sidechannel;
pub mod timestamper;

use self::config::Config;

/// Opened so integration tests and `main` share the same entry point.
pub async fn startup(config: Config) -> anyhow::Result<()> {
    scheduler::run(config).await
}
