//! Seeding a root [`Context`] from [`AppConfig`].

use anyhow::{Context as _, Result};
use ctxkit::Context;
use tracing::{debug, info};

use crate::config::AppConfig;

/// Build the root context: one constant binding per `bindings` entry and one
/// configuration binding (`<key>:$config`) per `configs` entry.
pub fn build_context(config: &AppConfig) -> Result<Context> {
    let settings = &config.context;
    let ctx = Context::named(settings.name.as_str());

    for (key, value) in &config.bindings {
        let binding = ctx
            .bind(key.as_str())
            .with_context(|| format!("Invalid binding key '{key}'"))?;
        binding.to(value.clone()).in_scope(settings.default_scope);
        if settings.lock_bindings {
            binding.lock();
        }
        debug!(key = %key, scope = %settings.default_scope, "Seeded binding");
    }

    for (key, value) in &config.configs {
        ctx.configure(key)
            .with_context(|| format!("Invalid configuration key '{key}'"))?
            .to(value.clone());
    }

    info!(
        context = ctx.name(),
        bindings = config.bindings.len(),
        configs = config.configs.len(),
        "Context ready"
    );
    Ok(ctx)
}
