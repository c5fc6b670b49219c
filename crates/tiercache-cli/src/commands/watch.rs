use anyhow::Result;
use colored::Colorize;
use tiercache::{DynStore, InvalidationKind, InvalidationMessage};

use crate::cli::OutputFormat;
use crate::output::{print_success, print_warning};

/// Print invalidation messages on `caches` until interrupted.
pub async fn watch(store: &DynStore, caches: &[String], format: OutputFormat) -> Result<()> {
    let mut subscriber = store.subscriber().await?;
    for cache in caches {
        subscriber.subscribe(cache).await?;
    }
    print_success(&format!("Watching {} (Ctrl-C to stop)", caches.join(", ")));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            message = subscriber.next_message() => {
                let Some(message) = message? else {
                    anyhow::bail!("subscription closed by the server");
                };
                match InvalidationMessage::from_bytes(&message.payload) {
                    Ok(invalidation) => print_invalidation(&invalidation, format),
                    Err(e) => print_warning(&format!(
                        "{}: unparseable message ({e})",
                        message.channel
                    )),
                }
            }
        }
    }
}

fn print_invalidation(message: &InvalidationMessage, format: OutputFormat) {
    if format == OutputFormat::Json {
        match serde_json::to_string(message) {
            Ok(json) => println!("{json}"),
            Err(e) => print_warning(&format!("cannot render message: {e}")),
        }
        return;
    }
    match (message.kind, &message.key) {
        (InvalidationKind::Evict, Some(key)) => {
            println!("{} {}:{}", "evict".yellow(), message.cache_name, key)
        }
        (InvalidationKind::Evict, None) => {
            println!("{} {} (no key)", "evict".yellow(), message.cache_name)
        }
        (InvalidationKind::Clear, _) => println!("{} {}", "clear".red(), message.cache_name),
    }
}
