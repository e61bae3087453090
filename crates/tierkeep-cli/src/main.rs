mod cli;
mod config;
mod storage;

use std::io::{self, Write};

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use tierkeep_core::{HardwareKeyProvider, Item, SecureBackend, SecurityTier};
use tierkeep_storage::Keystore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEALTH_SERVICE: &str = "tierkeep.health";

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let mut out = io::stdout().lock();
    match cli.command {
        Command::Version => print_version(&mut out)?,
        Command::Config(ConfigCommand::Init) => init_config(&config, &mut out)?,
        command => {
            let keystore = storage::keystore_from_config(&config)?;
            run(command, &keystore, config.default_tier, &mut out)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version(out: &mut impl Write) -> Result<()> {
    writeln!(out, "tierkeep {}", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}

fn init_config(config: &config::Config, out: &mut impl Write) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    writeln!(out, "Config initialized at {}", path.display())?;
    Ok(())
}

/// Dispatches the commands that need a keystore.
fn run<B, P>(
    command: Command,
    keystore: &Keystore<B, P>,
    default_tier: SecurityTier,
    out: &mut impl Write,
) -> Result<()>
where
    B: SecureBackend,
    P: HardwareKeyProvider,
{
    match command {
        Command::Put {
            service,
            key,
            value,
            tier,
        } => {
            let tier = tier.unwrap_or(default_tier);
            keystore.store(Item::new(key.as_str(), service.as_str(), value), tier)?;
            writeln!(out, "Stored {service}/{key} ({tier})")?;
        }
        Command::Get {
            service,
            key,
            no_cache,
            raw,
        } => {
            if raw {
                match keystore.get_stored_item(&key, &service)? {
                    Some(stored) => writeln!(
                        out,
                        "tier={} backup={} bytes={} value={}",
                        stored.tier,
                        stored.from_backup,
                        stored.item.value.len(),
                        hex(&stored.item.value)
                    )?,
                    None => color_eyre::eyre::bail!("{service}/{key} not found"),
                }
            } else {
                match keystore.get_item(&key, &service, !no_cache)? {
                    Some(item) => writeln!(out, "{}", String::from_utf8_lossy(&item.value))?,
                    None => color_eyre::eyre::bail!("{service}/{key} not found"),
                }
            }
        }
        Command::List { service } => {
            let items = keystore.get_all_items(&service, true)?;
            let mut keys: Vec<_> = items.keys().collect();
            keys.sort();
            for key in keys {
                writeln!(out, "{key}")?;
            }
        }
        Command::Delete { service, key } => {
            keystore.delete(&key, &service)?;
            writeln!(out, "Deleted {service}/{key}")?;
        }
        Command::Purge { service } => {
            let removed = keystore.purge_service(&service)?;
            writeln!(out, "Purged {removed} record(s) from {service}")?;
        }
        Command::Health => {
            run_keystore_health(keystore)?;
            writeln!(out, "Keystore: ok")?;
        }
        Command::Version | Command::Config(_) => {
            color_eyre::eyre::bail!("command does not use the keystore")
        }
    }
    Ok(())
}

/// Round-trips a probe item at every tier, bypassing the cache on read.
fn run_keystore_health<B, P>(keystore: &Keystore<B, P>) -> Result<()>
where
    B: SecureBackend,
    P: HardwareKeyProvider,
{
    for tier in SecurityTier::ALL {
        let probe = Item::new(format!("probe-{tier}"), HEALTH_SERVICE, b"ok".to_vec());
        keystore.store(probe.clone(), tier)?;
        let round_trip = keystore.get_item(&probe.key, HEALTH_SERVICE, false)?;
        keystore.delete(&probe.key, HEALTH_SERVICE)?;

        if round_trip.as_ref() != Some(&probe) {
            color_eyre::eyre::bail!("keystore round-trip failed at tier {tier}");
        }
        info!(%tier, "health probe ok");
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    fn run_to_string<B: SecureBackend, P: HardwareKeyProvider>(
        keystore: &Keystore<B, P>,
        command: Command,
    ) -> Result<String> {
        let mut out = Vec::new();
        run(command, keystore, SecurityTier::Medium, &mut out)?;
        Ok(String::from_utf8(out).expect("utf8 output"))
    }

    #[test]
    fn health_check_with_test_keystore_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = storage::test_keystore(dir.path());
        run_keystore_health(&keystore).expect("health check should succeed");
        assert!(keystore
            .get_all_items(HEALTH_SERVICE, false)
            .expect("list")
            .is_empty());
    }

    #[test]
    fn put_get_list_delete_flow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = storage::test_keystore(dir.path());

        let stored = run_to_string(
            &keystore,
            Command::Put {
                service: "S".into(),
                key: "u1".into(),
                value: "secret".into(),
                tier: None,
            },
        )
        .expect("put");
        assert_eq!(stored, "Stored S/u1 (medium)\n");

        let got = run_to_string(
            &keystore,
            Command::Get {
                service: "S".into(),
                key: "u1".into(),
                no_cache: true,
                raw: false,
            },
        )
        .expect("get");
        assert_eq!(got, "secret\n");

        let listed = run_to_string(&keystore, Command::List { service: "S".into() }).expect("list");
        assert_eq!(listed, "u1\n");

        run_to_string(
            &keystore,
            Command::Delete {
                service: "S".into(),
                key: "u1".into(),
            },
        )
        .expect("delete");
        let missing = run_to_string(
            &keystore,
            Command::Get {
                service: "S".into(),
                key: "u1".into(),
                no_cache: false,
                raw: false,
            },
        );
        assert!(missing.is_err());
    }

    #[test]
    fn raw_get_shows_tier_without_plaintext() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = storage::test_keystore(dir.path());
        keystore
            .store(Item::new("u1", "S", b"secret".to_vec()), SecurityTier::High)
            .expect("store");

        let raw = run_to_string(
            &keystore,
            Command::Get {
                service: "S".into(),
                key: "u1".into(),
                no_cache: false,
                raw: true,
            },
        )
        .expect("raw get");
        assert!(raw.starts_with("tier=high backup=false"));
        assert!(!raw.contains(&hex(b"secret")));
    }

    #[test]
    fn purge_reports_removed_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = storage::test_keystore(dir.path());
        for key in ["a", "b"] {
            keystore
                .store(Item::new(key, "S", b"v".to_vec()), SecurityTier::Low)
                .expect("store");
        }
        let purged = run_to_string(&keystore, Command::Purge { service: "S".into() }).expect("purge");
        assert_eq!(purged, "Purged 2 record(s) from S\n");
    }
}
