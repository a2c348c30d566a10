//! Download command - Bulk download items from the REST backend
//!
//! Provides the `shiplink download` CLI command which:
//! 1. Collects item ids from the command line and/or a file
//! 2. Builds the rate limiter, REST client and auth refresh from configuration
//! 3. Runs the bulk download, writing each payload to the output directory
//! 4. Prints the per-item report and the limiter statistics
//!
//! Ctrl+C stops the run; items not finished by then are reported as cancelled.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context as _, Result};
use clap::Args;
use shiplink_client::{
    auth_refresh::AuthRefreshCoordinator,
    bulk::{BulkReport, BulkRunner, FetchOutcome},
    client::RestClient,
    rate_limit::{AdaptiveRateLimiter, LimiterConfig, LimiterStats},
};
use shiplink_core::domain::ItemId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    commands::load_checked_config,
    output::{get_formatter, OutputFormat, OutputFormatter},
    Context,
};

#[derive(Debug, Args)]
pub struct DownloadCommand {
    /// Item ids to download
    pub ids: Vec<String>,

    /// Read additional item ids from a file, one per line ('#' starts a comment)
    #[arg(long, value_name = "FILE")]
    pub from_file: Option<PathBuf>,

    /// Directory the payloads are written to
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Bearer token for the REST backend
    #[arg(long, env = "SHIPLINK_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl DownloadCommand {
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        let formatter = get_formatter(ctx.format, ctx.quiet);

        let ids = self.collect_ids()?;
        if ids.is_empty() {
            bail!("No item ids given; pass ids as arguments or use --from-file");
        }

        let config = load_checked_config(&ctx.config_path)?;
        info!(
            config_path = %ctx.config_path.display(),
            items = ids.len(),
            "Starting download"
        );

        tokio::fs::create_dir_all(&self.output)
            .await
            .with_context(|| format!("Failed to create {}", self.output.display()))?;

        let limiter = Arc::new(AdaptiveRateLimiter::new(
            LimiterConfig::from(&config.rate_limiting),
            config.status.clone(),
        ));
        let client = Arc::new(
            RestClient::from_config(&config)
                .context("Failed to create REST client")?
                .with_rate_limiter(Arc::clone(&limiter)),
        );
        if let Some(token) = &self.token {
            client.set_access_token(token.as_str());
        }
        client.enable_auth_refresh(Arc::new(AuthRefreshCoordinator::new()));

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

        let runner = BulkRunner::new(Arc::clone(&limiter)).with_cancellation(cancel);
        let output = Arc::new(self.output.clone());
        let report = runner
            .run(ids, move |item_id| {
                let client = Arc::clone(&client);
                let output = Arc::clone(&output);
                async move { fetch_to_file(&client, &output, &item_id).await }
            })
            .await;
        watcher.abort();

        let stats = limiter.stats();
        print_report(formatter.as_ref(), ctx.format, &report, &stats, &self.output)?;

        if !report.is_success() {
            bail!(
                "{} of {} items were not downloaded",
                report.total() - report.succeeded.len(),
                report.total()
            );
        }
        Ok(())
    }

    /// Command-line ids followed by file ids, validated, first occurrence
    /// kept.
    fn collect_ids(&self) -> Result<Vec<String>> {
        let mut raw = self.ids.clone();
        if let Some(path) = &self.from_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read item ids from {}", path.display()))?;
            raw.extend(parse_id_list(&content));
        }

        let mut seen = HashSet::new();
        let mut ids = Vec::with_capacity(raw.len());
        for id in raw {
            let id = ItemId::new(id).context("Invalid item id")?;
            if seen.insert(id.clone()) {
                ids.push(String::from(id));
            }
        }
        Ok(ids)
    }
}

/// Ids from an id file: one per line, blank lines and `#` comments skipped.
fn parse_id_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// File name for an item's payload; path separators and other characters
/// unsafe in file names become `_`.
fn payload_file_name(item_id: &str) -> String {
    let name: String = item_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    match name.as_str() {
        "." | ".." => name.replace('.', "_"),
        _ => name,
    }
}

async fn fetch_to_file(client: &RestClient, output: &Path, item_id: &str) -> FetchOutcome {
    let bytes = match client.download(item_id).await {
        Ok(bytes) => bytes,
        Err(e) => return FetchOutcome::from(e),
    };

    let path = output.join(payload_file_name(item_id));
    match tokio::fs::write(&path, &bytes).await {
        Ok(()) => {
            debug!(item_id, path = %path.display(), bytes = bytes.len(), "Payload written");
            FetchOutcome::Done
        }
        Err(e) => FetchOutcome::Fatal {
            error: format!("failed to write {}: {e}", path.display()),
        },
    }
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received SIGINT (Ctrl+C), cancelling download");
        token.cancel();
    }
}

fn print_report(
    formatter: &dyn OutputFormatter,
    format: OutputFormat,
    report: &BulkReport,
    stats: &LimiterStats,
    output: &Path,
) -> Result<()> {
    if format == OutputFormat::Json {
        let json = serde_json::json!({
            "success": report.is_success(),
            "output": output.display().to_string(),
            "report": report,
            "limiter": stats,
        });
        formatter.print_json(&json);
        return Ok(());
    }

    if report.is_success() {
        formatter.success(&format!(
            "Downloaded {} item{} to {}",
            report.succeeded.len(),
            if report.succeeded.len() == 1 { "" } else { "s" },
            output.display()
        ));
    } else {
        formatter.warn(&format!(
            "Downloaded {} of {} items to {}",
            report.succeeded.len(),
            report.total(),
            output.display()
        ));
    }

    for item_id in &report.failed {
        formatter.error(&format!("{item_id}: gave up after repeated failures"));
    }
    for item in &report.fatal {
        formatter.error(&format!("{}: {}", item.item_id, item.error));
    }
    if !report.cancelled.is_empty() {
        formatter.warn(&format!(
            "Cancelled before completion: {}",
            report.cancelled.join(", ")
        ));
    }

    formatter.info("");
    formatter.field("Successful calls", &stats.success_count);
    formatter.field("Rate limited", &stats.rate_limit_count);
    formatter.field(
        "Workers",
        &format!("{}/{}", stats.active_workers, stats.max_workers),
    );
    formatter.field("Backoff", &format!("{:.1}s", stats.current_backoff_secs));
    Ok(())
}
