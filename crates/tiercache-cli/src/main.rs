mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands, ConfigCommands};
use output::{print_error, print_success, print_warning};
use tiercache::{CacheRegistry, RedisConfig, TierCacheConfig, load_config, observability};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();
    let config = resolve_config(&cli)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    observability::init_tracing_with_level(level);

    // Configuration commands never touch the store.
    if let Commands::Config(args) = &cli.command {
        return match &args.command {
            ConfigCommands::Show => commands::config::show(&config, format),
            ConfigCommands::Cache(cache) => commands::config::cache(&config, &cache.cache, format),
        };
    }

    if !config.redis.enabled {
        print_warning("Redis is disabled; commands act on a store local to this process");
    }
    tracing::debug!(redis = config.redis.enabled, url = %config.redis.url, "connecting to cache store");
    let registry = CacheRegistry::connect(config).await?;
    let result = match &cli.command {
        Commands::Get(args) => commands::entry::get(&registry, args, format).await,
        Commands::Put(args) => commands::entry::put(&registry, args).await,
        Commands::Evict(args) => commands::entry::evict(&registry, args).await,
        Commands::Clear(args) => commands::entry::clear(&registry, args).await,
        Commands::Ttl(args) => commands::entry::ttl(&registry, args, format).await,
        Commands::Watch(args) => {
            commands::watch::watch(registry.store(), &args.caches, format).await
        }
        Commands::Ping => registry
            .store()
            .ping()
            .await
            .map(|()| print_success("Store reachable"))
            .map_err(Into::into),
        Commands::Config(_) => Ok(()),
    };
    registry.shutdown().await;
    result
}

fn resolve_config(cli: &Cli) -> Result<TierCacheConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(url) = &cli.redis_url {
        config.redis = RedisConfig {
            enabled: true,
            url: url.clone(),
            ..config.redis
        };
    }
    Ok(config)
}
