use tracing_subscriber::EnvFilter;

use crate::shared::config::CONFIG;

/// Installs a process-wide subscriber for hosts that embed the cache without
/// one of their own. The library itself only emits `tracing` events under
/// `striadb::*` targets; an embedding engine that already runs a subscriber
/// must not call this.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&CONFIG.logging.level)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[cfg(test)]
pub fn init_for_tests() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::from_default_env().add_directive("stria_db=debug".parse().unwrap());

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}
