use anyhow::{Context, Result};
use serde_json::json;
use tiercache::TierCacheConfig;

use crate::cli::OutputFormat;
use crate::output::{print_field, print_value};

pub fn show(config: &TierCacheConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            print_value(&serde_json::to_value(config)?, format);
        }
        OutputFormat::Text => {
            let rendered = toml::to_string_pretty(config).context("rendering configuration")?;
            println!("{rendered}");
        }
    }
    Ok(())
}

pub fn cache(config: &TierCacheConfig, name: &str, format: OutputFormat) -> Result<()> {
    let settings = config.settings_for(name);
    let configured = config.caches.contains_key(name);
    match format {
        OutputFormat::Json => print_value(
            &json!({
                "cache": name,
                "configured": configured,
                "fingerprint": settings.fingerprint(),
                "settings": settings,
            }),
            format,
        ),
        OutputFormat::Text => {
            print_field("Cache", name);
            print_field("Source", if configured { "configured" } else { "defaults" });
            print_field("Fingerprint", settings.fingerprint());
            println!(
                "{}",
                toml::to_string_pretty(settings).context("rendering settings")?
            );
        }
    }
    Ok(())
}
