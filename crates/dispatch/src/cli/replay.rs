//! `replay`: run a scripted trigger scenario in memory.
//!
//! ```yaml
//! alerts:
//!   - id: disk-full
//!     text: disk usage above 95%
//! alerters:
//!   - kind: log
//!     name: log
//!   - kind: webhook
//!     name: ops
//!     url: http://localhost:8080/hook
//! triggers:
//!   - { at_ms: 0, operation: new_event, alert: disk-full }
//!   - { at_ms: 500, operation: recovery, alert: disk-full, text: closed }
//! ```

use alerter::{Alert, AlertStatus, Alerter, AlerterRegistry, LogAlerter, Operation, WebhookAlerter};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use dispatch::{
    AlerterProgress, Dispatcher, LocalScheduler, MemoryAlerts, MemoryStore, OperationRecord,
    ScheduleOutcome, ScheduleRequest,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ui;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Consecutive idle polls before the run counts as settled.
const QUIET_POLLS: u32 = 4;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub alerts: Vec<ScenarioAlert>,
    pub alerters: Vec<AlerterSpec>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioAlert {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum AlerterSpec {
    Log {
        name: String,
    },
    Webhook {
        name: String,
        url: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Trigger {
    /// Offset from the start of the replay
    #[serde(default)]
    pub at_ms: u64,
    pub operation: Operation,
    pub alert: String,
    /// Target alerter; every registered alerter when omitted
    #[serde(default)]
    pub alerter: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
}

impl Scenario {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let scenario: Self = serde_yaml::from_str(yaml).context("parsing scenario")?;
        if scenario.alerters.is_empty() {
            bail!("scenario declares no alerters");
        }
        Ok(scenario)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    pub fn registry(&self) -> Result<AlerterRegistry> {
        let mut registry = AlerterRegistry::new();
        for spec in &self.alerters {
            let alerter: Arc<dyn Alerter> = match spec {
                AlerterSpec::Log { name } => Arc::new(LogAlerter::new(name)),
                AlerterSpec::Webhook {
                    name,
                    url,
                    timeout_secs: Some(secs),
                } => Arc::new(
                    WebhookAlerter::with_timeout(name, url, Duration::from_secs(*secs))
                        .with_context(|| format!("building webhook alerter {name}"))?,
                ),
                AlerterSpec::Webhook {
                    name,
                    url,
                    timeout_secs: None,
                } => Arc::new(
                    WebhookAlerter::new(name, url)
                        .with_context(|| format!("building webhook alerter {name}"))?,
                ),
            };
            registry.register(alerter);
        }
        Ok(registry)
    }

    /// Triggers in firing order.
    fn timeline(&self) -> Vec<Trigger> {
        let mut triggers = self.triggers.clone();
        triggers.sort_by_key(|t| t.at_ms);
        triggers
    }
}

impl ScenarioAlert {
    fn to_alert(&self) -> Alert {
        let mut alert = Alert::open(&self.id, &self.text);
        alert.tags.clone_from(&self.tags);
        alert
    }
}

pub async fn run(
    scenario_path: &Path,
    config_path: Option<&Path>,
    timeout_secs: u64,
    json: bool,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let scenario = Scenario::from_file(scenario_path)?;
    let concurrency = config.concurrency;

    let alerts = Arc::new(MemoryAlerts::new());
    for alert in &scenario.alerts {
        alerts.upsert(alert.to_alert()).await;
    }
    let (scheduler, jobs) = LocalScheduler::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(MemoryStore::new()),
        Arc::new(scheduler.clone()),
        alerts.clone(),
        scenario.registry()?,
        Arc::new(config),
    ));

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(
        Arc::clone(&dispatcher).run_worker(jobs, concurrency, shutdown.clone()),
    );

    if !json {
        ui::print_section("Triggers");
    }
    let started = Instant::now();
    for trigger in scenario.timeline() {
        tokio::time::sleep_until(started + Duration::from_millis(trigger.at_ms)).await;
        fire(&dispatcher, &alerts, &trigger, json).await;
    }

    wait_until_settled(&scheduler, &dispatcher, Duration::from_secs(timeout_secs)).await?;
    shutdown.cancel();
    worker.await.context("dispatch worker panicked")?;

    let mut report = BTreeMap::new();
    for alert in &scenario.alerts {
        report.insert(alert.id.clone(), dispatcher.progress(&alert.id).await?);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn fire(dispatcher: &Dispatcher, alerts: &MemoryAlerts, trigger: &Trigger, quiet: bool) {
    // Keep the alert record in step with the trigger, as the alert store would.
    match trigger.operation {
        Operation::Recovery => {
            alerts
                .modify(&trigger.alert, |a| a.status = AlertStatus::Closed)
                .await;
        }
        Operation::NewEvent => {
            alerts
                .modify(&trigger.alert, |a| a.status = AlertStatus::Open)
                .await;
        }
        Operation::Repeat | Operation::Action => {}
    }

    let targets = match &trigger.alerter {
        Some(name) => vec![name.clone()],
        None => dispatcher.alerters().names(),
    };
    let text = trigger
        .text
        .clone()
        .unwrap_or_else(|| trigger.operation.to_string());

    for alerter in targets {
        let mut request = ScheduleRequest::new(trigger.operation, &trigger.alert, &alerter, &text);
        if let Some(action) = &trigger.action {
            request = request.with_action(action);
        }
        let result = dispatcher.schedule(request).await;
        if quiet {
            continue;
        }
        let label = format!(
            "+{}ms {} {}/{}",
            trigger.at_ms, trigger.operation, trigger.alert, alerter
        );
        match result {
            Ok(ScheduleOutcome::Submitted(job_id)) => {
                ui::print_info(&format!("{label}: submitted {job_id}"));
            }
            Ok(ScheduleOutcome::Chained(onto)) => {
                ui::print_info(&format!("{label}: chained onto {onto}"));
            }
            Ok(ScheduleOutcome::Deferred) => {
                ui::print_info(&format!("{label}: deferred to pending new_event"));
            }
            Ok(ScheduleOutcome::Ignored(reason)) => {
                ui::print_warning(&format!("{label}: ignored ({reason})"));
            }
            Err(e) => ui::print_warning(&format!("{label}: {e}")),
        }
    }
}

async fn wait_until_settled(
    scheduler: &LocalScheduler,
    dispatcher: &Dispatcher,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut quiet = 0;
    while quiet < QUIET_POLLS {
        if Instant::now() >= deadline {
            bail!(
                "{} jobs still pending after {}s",
                scheduler.pending_count() + dispatcher.running_jobs(),
                timeout.as_secs()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
        if scheduler.pending_count() == 0 && dispatcher.running_jobs() == 0 {
            quiet += 1;
        } else {
            quiet = 0;
        }
    }
    debug!("Replay settled");
    Ok(())
}

fn print_report(report: &BTreeMap<String, Vec<AlerterProgress>>) {
    for (alert_id, pairs) in report {
        ui::print_section(&format!("Alert {alert_id}"));
        for pair in pairs {
            println!(
                "  {} {} (repeats: {})",
                pair.alerter.bold(),
                ui::status(pair.status),
                pair.repeat_count
            );
            for record in pair.latest.values() {
                println!("    {}", describe(record));
            }
        }
    }
}

fn describe(record: &OperationRecord) -> String {
    let outcome = if !record.is_finished() {
        "pending".bright_black()
    } else if record.skipped {
        "skipped".yellow()
    } else if record.success {
        "ok".green()
    } else {
        "failed".red()
    };
    let detail = record
        .failure_reason
        .clone()
        .or_else(|| {
            record
                .response
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_default();
    format!(
        "{:<16} {:<8} retries={} {}",
        format!("{}#{}", record.id.operation, record.id.execution),
        outcome,
        record.retries,
        detail.bright_black()
    )
}
