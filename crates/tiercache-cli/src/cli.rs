use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tiercache")]
#[command(about = "tiercache CLI: inspect and invalidate two-tier caches")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "TIERCACHE_CONFIG")]
    pub config: Option<String>,

    /// Redis URL (overrides the configuration file; enables Redis)
    #[arg(short, long, global = true, env = "TIERCACHE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,

    /// Log level (overrides the configuration file)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read an entry (JSON view of the stored value)
    Get(EntryArgs),
    /// Write an entry through both tiers and broadcast the invalidation
    Put(PutArgs),
    /// Evict an entry from every instance
    Evict(EntryArgs),
    /// Remove every entry of a cache (prefixed caches only)
    Clear(CacheArgs),
    /// Show the remaining lifetime of an entry
    Ttl(EntryArgs),
    /// Print invalidation messages as they are published
    Watch(WatchArgs),
    /// Check connectivity to the distributed store
    Ping,
    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(clap::Args)]
pub struct CacheArgs {
    /// Cache name
    pub cache: String,
}

#[derive(clap::Args)]
pub struct EntryArgs {
    /// Cache name
    pub cache: String,
    /// Entry key
    pub key: String,
}

#[derive(clap::Args)]
pub struct PutArgs {
    /// Cache name
    pub cache: String,
    /// Entry key
    pub key: String,
    /// Value as JSON (omit with --null)
    #[arg(required_unless_present = "null")]
    pub value: Option<String>,
    /// Store a null (requires allow_null on the cache)
    #[arg(long, conflicts_with = "value")]
    pub null: bool,
}

#[derive(clap::Args)]
pub struct WatchArgs {
    /// Cache names to watch
    #[arg(required = true)]
    pub caches: Vec<String>,
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the merged configuration
    Show,
    /// Show the settings a cache name resolves to
    Cache(CacheArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let cli = Cli::try_parse_from(["tiercache", "get", "users", "42"]).unwrap();
        match cli.command {
            Commands::Get(args) => {
                assert_eq!(args.cache, "users");
                assert_eq!(args.key, "42");
            }
            _ => panic!("expected get"),
        }
        assert!(cli.format.is_none());
    }

    #[test]
    fn test_parse_put_value_and_null() {
        let cli = Cli::try_parse_from(["tiercache", "put", "users", "42", r#"{"name":"ada"}"#])
            .unwrap();
        match cli.command {
            Commands::Put(args) => {
                assert_eq!(args.value.as_deref(), Some(r#"{"name":"ada"}"#));
                assert!(!args.null);
            }
            _ => panic!("expected put"),
        }

        let cli = Cli::try_parse_from(["tiercache", "put", "users", "42", "--null"]).unwrap();
        assert!(matches!(cli.command, Commands::Put(PutArgs { null: true, value: None, .. })));
    }

    #[test]
    fn test_put_requires_value_or_null() {
        assert!(Cli::try_parse_from(["tiercache", "put", "users", "42"]).is_err());
        assert!(Cli::try_parse_from(["tiercache", "put", "users", "42", "1", "--null"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tiercache",
            "clear",
            "users",
            "--format",
            "json",
            "--redis-url",
            "redis://cache:6379",
        ])
        .unwrap();
        assert_eq!(cli.format, Some(OutputFormat::Json));
        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_watch_requires_cache_names() {
        assert!(Cli::try_parse_from(["tiercache", "watch"]).is_err());
        let cli = Cli::try_parse_from(["tiercache", "watch", "users", "orders"]).unwrap();
        match cli.command {
            Commands::Watch(args) => assert_eq!(args.caches, vec!["users", "orders"]),
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["tiercache", "config", "cache", "users"]).unwrap();
        match cli.command {
            Commands::Config(ConfigArgs {
                command: ConfigCommands::Cache(args),
            }) => assert_eq!(args.cache, "users"),
            _ => panic!("expected config cache"),
        }
    }
}
