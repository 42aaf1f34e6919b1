//! Bulk classification command: `ticketserver bulk-classify [options]`.

use anyhow::{anyhow, bail};
use diesel::prelude::*;
use std::sync::Arc;

use super::{enqueue, ClassifyJob};
use crate::config::AppConfig;
use crate::schema::tickets;
use crate::shared::utils::create_conn;
use crate::tickets::{Ticket, STATUSES};

#[derive(Debug, PartialEq)]
pub struct BulkOptions {
    pub status: Option<String>,
    pub unclassified_only: bool,
    pub limit: i64,
    pub preserve_manual: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            status: None,
            unclassified_only: false,
            limit: 50,
            preserve_manual: false,
        }
    }
}

pub fn parse_args(args: &[String]) -> Result<BulkOptions, String> {
    let mut opts = BulkOptions::default();
    for arg in args {
        if arg == "--unclassified" {
            opts.unclassified_only = true;
        } else if arg == "--preserve-manual" {
            opts.preserve_manual = true;
        } else if let Some(value) = arg.strip_prefix("--status=") {
            opts.status = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--limit=") {
            opts.limit = value
                .parse()
                .map_err(|_| format!("Invalid limit: {value}"))?;
        } else {
            return Err(format!("Unknown option: {arg}"));
        }
    }
    Ok(opts)
}

/// Dispatch classification jobs for the matching tickets and report how many
/// were queued vs. skipped. Never waits for job completion.
pub async fn run(args: &[String]) -> anyhow::Result<()> {
    let opts = parse_args(args).map_err(|e| anyhow!(e))?;

    if let Some(status) = &opts.status {
        if !STATUSES.contains(&status.as_str()) {
            bail!("Invalid status. Valid statuses: {}", STATUSES.join(", "));
        }
    }

    println!("Starting bulk ticket classification...");

    let config = AppConfig::from_env()?;
    let pool = create_conn(&config.database_url)?;
    let cache = Arc::new(redis::Client::open(config.cache_url.as_str())?);
    let mut conn = pool.get()?;

    let mut query = tickets::table.into_boxed();
    if let Some(status) = &opts.status {
        query = query.filter(tickets::status.eq(status.clone()));
    }
    if opts.unclassified_only {
        query = query.filter(tickets::category.is_null());
    }

    let candidates: Vec<Ticket> = query.limit(opts.limit).load(&mut conn)?;

    if candidates.is_empty() {
        println!("No tickets found matching the criteria.");
        return Ok(());
    }

    println!("Found {} tickets to classify.", candidates.len());

    let mut dispatched = 0usize;
    let mut skipped = 0usize;

    for ticket in candidates {
        if opts.preserve_manual && ticket.is_manually_categorized() {
            skipped += 1;
            continue;
        }

        let job = ClassifyJob::new(ticket.id, opts.preserve_manual);
        enqueue(&cache, &job).await?;
        dispatched += 1;
    }

    println!("Dispatched {dispatched} classification jobs to the queue ({skipped} skipped).");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_all_options() {
        let opts = parse_args(&args(&[
            "--status=open",
            "--unclassified",
            "--limit=10",
            "--preserve-manual",
        ]))
        .unwrap();

        assert_eq!(
            opts,
            BulkOptions {
                status: Some("open".to_string()),
                unclassified_only: true,
                limit: 10,
                preserve_manual: true,
            }
        );
    }

    #[test]
    fn defaults_apply_when_no_options_given() {
        let opts = parse_args(&[]).unwrap();
        assert_eq!(opts, BulkOptions::default());
        assert_eq!(opts.limit, 50);
    }

    #[test]
    fn rejects_unknown_options_and_bad_limits() {
        assert!(parse_args(&args(&["--force"])).is_err());
        assert!(parse_args(&args(&["--limit=lots"])).is_err());
    }
}
