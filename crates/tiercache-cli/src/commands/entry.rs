use anyhow::{Context, Result};
use serde_json::{Value, json};
use tiercache::{CacheRegistry, CacheValue, KeyTtl};

use crate::cli::{CacheArgs, EntryArgs, OutputFormat, PutArgs};
use crate::output::{print_field, print_success, print_value, print_warning};

pub async fn get(registry: &CacheRegistry, args: &EntryArgs, format: OutputFormat) -> Result<()> {
    let cache = registry.get_configured(&args.cache)?;
    // This process has a cold in-process tier; read the shared copy.
    let entry = cache
        .remote()
        .lookup::<Value>(&args.key)
        .await
        .with_context(|| format!("reading {}:{}", args.cache, args.key))?;

    if format == OutputFormat::Json {
        let (state, value) = match entry {
            CacheValue::Present(value) => ("present", value),
            CacheValue::PresentNull => ("null", Value::Null),
            CacheValue::Absent => ("absent", Value::Null),
        };
        print_value(
            &json!({ "cache": args.cache, "key": args.key, "state": state, "value": value }),
            format,
        );
        return Ok(());
    }

    match entry {
        CacheValue::Present(value) => print_value(&value, format),
        CacheValue::PresentNull => print_warning("cached null"),
        CacheValue::Absent => print_warning(&format!("{}:{} not found", args.cache, args.key)),
    }
    Ok(())
}

pub async fn put(registry: &CacheRegistry, args: &PutArgs) -> Result<()> {
    let cache = registry.get_configured(&args.cache)?;
    let value = match &args.value {
        Some(raw) if !args.null => {
            Some(serde_json::from_str::<Value>(raw).context("value must be valid JSON")?)
        }
        _ => None,
    };
    cache.put(&args.key, value.as_ref()).await?;

    if value.is_none() && !cache.settings().second.allow_null {
        print_warning("nulls are not cached by this cache; the entry was removed");
    } else {
        print_success(&format!("Stored {}:{}", args.cache, args.key));
    }
    Ok(())
}

pub async fn evict(registry: &CacheRegistry, args: &EntryArgs) -> Result<()> {
    for cache in caches_or_configured(registry, &args.cache)? {
        cache.evict(&args.key).await?;
    }
    print_success(&format!("Evicted {}:{}", args.cache, args.key));
    Ok(())
}

pub async fn clear(registry: &CacheRegistry, args: &CacheArgs) -> Result<()> {
    let cache = registry.get_configured(&args.cache)?;
    if !cache.settings().second.use_prefix {
        print_warning("use_prefix is disabled for this cache; only local tiers are cleared");
    }
    cache.clear().await?;
    print_success(&format!("Cleared {}", args.cache));
    Ok(())
}

pub async fn ttl(registry: &CacheRegistry, args: &EntryArgs, format: OutputFormat) -> Result<()> {
    let cache = registry.get_configured(&args.cache)?;
    let ttl = cache.ttl(&args.key).await?;

    if format == OutputFormat::Json {
        let remaining_ms = ttl.remaining().map(|d| d.as_millis() as u64);
        let state = match ttl {
            KeyTtl::Missing => "missing",
            KeyTtl::Persistent => "persistent",
            KeyTtl::Expires(_) => "expires",
        };
        print_value(&json!({ "state": state, "remaining_ms": remaining_ms }), format);
        return Ok(());
    }

    match ttl {
        KeyTtl::Missing => print_warning(&format!("{}:{} not found", args.cache, args.key)),
        KeyTtl::Persistent => print_field("TTL", "none (persistent)"),
        KeyTtl::Expires(remaining) => print_field("TTL", format!("{} ms", remaining.as_millis())),
    }
    Ok(())
}

fn caches_or_configured(
    registry: &CacheRegistry,
    name: &str,
) -> Result<Vec<std::sync::Arc<tiercache::LayeredCache>>> {
    let caches = registry.caches(name);
    if caches.is_empty() {
        return Ok(vec![registry.get_configured(name)?]);
    }
    Ok(caches)
}
