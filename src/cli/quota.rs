//! Quota status, check, and record command handlers.

use anyhow::{Context, Result};

use usage_ledger::accountant::{QuotaStatus, UsageAccountant};
use usage_ledger::config::LedgerConfig;
use usage_ledger::policy::QuotaLevel;

use super::Commands;

/// Handle a parsed subcommand against the configured ledger.
pub(crate) async fn cmd_quota(command: Commands, config: &LedgerConfig) -> Result<()> {
    match command {
        Commands::Config => {
            let json = serde_json::to_string_pretty(config)
                .with_context(|| "Failed to serialize configuration")?;
            println!("{json}");
        }
        Commands::Status => {
            let accountant = open(config).await?;
            let snapshot = accountant.store().snapshot().await?;

            if snapshot.is_empty() {
                println!("No usage recorded.");
                return Ok(());
            }

            println!(
                "{:<24} {:<12} {:>14} {:>10}",
                "Subject", "Day", "Units Used", "Requests"
            );
            println!("{}", "-".repeat(63));

            for record in snapshot {
                println!(
                    "{:<24} {:<12} {:>14} {:>10}",
                    record.subject_id,
                    record.day.to_string(),
                    record.consumed_units,
                    record.request_count,
                );
            }
        }
        Commands::Check { subject, limit } => {
            let accountant = open(config).await?;
            let status = accountant.check_quota(subject.trim(), limit).await?;
            print_status(&status);
        }
        Commands::Record {
            subject,
            units,
            limit,
        } => {
            let accountant = open(config).await?;
            let status = accountant
                .record_consumption(subject.trim(), units, limit)
                .await?;
            print_status(&status);
        }
    }

    Ok(())
}

async fn open(config: &LedgerConfig) -> Result<UsageAccountant> {
    UsageAccountant::from_config(config).await.with_context(|| {
        format!(
            "Failed to open usage store at {}",
            config.store_path().display()
        )
    })
}

fn print_status(status: &QuotaStatus) {
    let state = match status.level {
        QuotaLevel::Ok => "ok",
        QuotaLevel::Warning(_) => "warning",
        QuotaLevel::Exhausted => "exhausted",
    };
    println!("Subject:    {}", status.record.subject_id);
    println!("Day:        {}", status.record.day);
    println!("Allowed:    {}", if status.allowed { "yes" } else { "no" });
    println!("State:      {state}");
    println!(
        "Used:       {} / {} ({:.1}%)",
        status.record.consumed_units, status.daily_limit, status.usage_percentage
    );
    println!("Remaining:  {}", status.remaining_units);
    println!("Requests:   {}", status.record.request_count);
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use usage_ledger::accountant::UsageAccountant;
    use usage_ledger::config::{BackendKind, LedgerConfig};

    fn config_in(dir: &TempDir) -> LedgerConfig {
        LedgerConfig {
            backend: BackendKind::Json,
            path: Some(dir.path().join("usage.json")),
            daily_limit: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_status_empty() {
        let dir = TempDir::new().unwrap();
        let acct = UsageAccountant::from_config(&config_in(&dir)).await.unwrap();
        let snap = acct.store().snapshot().await.unwrap();
        assert!(snap.is_empty(), "fresh store should be empty");
    }

    #[tokio::test]
    async fn test_record_persists_between_invocations() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        super::cmd_quota(
            super::Commands::Record {
                subject: "u1".into(),
                units: 40,
                limit: None,
            },
            &config,
        )
        .await
        .unwrap();

        let acct = UsageAccountant::from_config(&config).await.unwrap();
        let status = acct.check_quota("u1", None).await.unwrap();
        assert_eq!(status.record.consumed_units, 40);
        assert_eq!(status.remaining_units, 60);
    }

    #[tokio::test]
    async fn test_record_zero_units_fails() {
        let dir = TempDir::new().unwrap();
        let result = super::cmd_quota(
            super::Commands::Record {
                subject: "u1".into(),
                units: 0,
                limit: None,
            },
            &config_in(&dir),
        )
        .await;
        assert!(result.is_err());
    }
}
