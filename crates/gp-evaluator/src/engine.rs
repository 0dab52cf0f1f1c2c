//! Evaluation engine: wires the pure rule semantics to the store under a
//! per-tenant advisory lock, and drives the wake/poll loop.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use gp_bus::{Bus, BusConsumer};
use gp_observe::{Counter, write_counter};
use gp_protocol::{
    AlertRule, AlertType, DeviceStatus, RuleMode, StreamKind, heartbeat_fingerprint,
    rule_fingerprint, tenant_of_subject,
};
use gp_store::telemetry::Reading;
use gp_store::{AdvisoryLock, tenants::TenantSettings};

use crate::config::EvaluatorConfig;
use crate::eval::{rule_fires, rule_summary};
use crate::status::device_status;

#[derive(Clone, Default)]
pub struct EvaluatorMetrics {
    pub passes_total: Counter,
    pub alerts_opened_total: Counter,
    pub alerts_closed_total: Counter,
}

impl EvaluatorMetrics {
    pub fn render(&self) -> String {
        let mut buf = String::with_capacity(512);
        write_counter(
            &mut buf,
            "gp_evaluator_passes_total",
            "Tenant evaluation passes completed.",
            &self.passes_total,
        );
        write_counter(
            &mut buf,
            "gp_evaluator_alerts_opened_total",
            "Alerts opened.",
            &self.alerts_opened_total,
        );
        write_counter(
            &mut buf,
            "gp_evaluator_alerts_closed_total",
            "Alerts closed.",
            &self.alerts_closed_total,
        );
        buf
    }
}

/// Evaluate one tenant: device heartbeats, then rules.
///
/// Only one evaluator instance may mutate a tenant's alerts at a time;
/// the advisory lock scoped to `evaluator:{tenant}` enforces it. When
/// another instance holds the lock this pass is skipped.
pub async fn evaluate_tenant(
    pool: &PgPool,
    tenant: &str,
    config: &EvaluatorConfig,
    metrics: &EvaluatorMetrics,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let scope = format!("evaluator:{tenant}");
    let Some(lock) = AdvisoryLock::try_acquire(pool, &scope).await? else {
        tracing::debug!(tenant, "another evaluator holds the lock, skipping");
        return Ok(());
    };

    let result = evaluate_tenant_locked(pool, tenant, config, metrics, now).await;
    lock.release().await?;
    metrics.passes_total.inc();
    result
}

async fn evaluate_tenant_locked(
    pool: &PgPool,
    tenant: &str,
    config: &EvaluatorConfig,
    metrics: &EvaluatorMetrics,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let settings = gp_store::tenants::settings(pool, tenant).await?;
    heartbeat_pass(pool, tenant, &settings, metrics, now).await?;
    rule_pass(pool, tenant, config, metrics, now).await
}

/// Recompute device status from heartbeat age; transitions to OFFLINE
/// open a NO_HEARTBEAT alert, returns to ONLINE close it.
async fn heartbeat_pass(
    pool: &PgPool,
    tenant: &str,
    settings: &TenantSettings,
    metrics: &EvaluatorMetrics,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let states = gp_store::devices::device_states(pool, tenant).await?;
    for state in states {
        let new_status = device_status(
            state.last_seen_at,
            now,
            settings.heartbeat_stale_seconds,
            settings.heartbeat_offline_seconds,
        );
        if new_status.as_str() == state.status {
            continue;
        }

        gp_store::devices::set_device_status(pool, tenant, &state.device_id, new_status).await?;
        tracing::info!(
            tenant,
            device = %state.device_id,
            from = %state.status,
            to = new_status.as_str(),
            "device status changed"
        );

        let fingerprint = heartbeat_fingerprint(&state.device_id);
        match new_status {
            DeviceStatus::Offline => {
                if gp_store::alerts::find_open(pool, tenant, &fingerprint)
                    .await?
                    .is_none()
                {
                    gp_store::alerts::insert_open(
                        pool,
                        tenant,
                        &state.device_id,
                        None,
                        AlertType::NoHeartbeat,
                        gp_protocol::Severity::Critical,
                        &fingerprint,
                        &format!("{}: no heartbeat", state.device_id),
                        now,
                    )
                    .await?;
                    metrics.alerts_opened_total.inc();
                }
            }
            DeviceStatus::Online => {
                if gp_store::alerts::close_open(pool, tenant, &fingerprint, now).await? {
                    metrics.alerts_closed_total.inc();
                }
            }
            DeviceStatus::Stale => {}
        }
    }
    Ok(())
}

/// Metrics a rule needs readings for.
fn rule_metrics(mode: &RuleMode) -> Vec<&str> {
    match mode {
        RuleMode::Threshold { metric, .. } | RuleMode::Anomaly { metric, .. } => vec![metric],
        RuleMode::Multi { conditions, .. } => {
            conditions.iter().map(|c| c.metric.as_str()).collect()
        }
    }
}

/// Window the evaluator must look back over for one rule.
fn rule_lookback(rule: &AlertRule, anomaly_window: Duration) -> ChronoDuration {
    let secs = match &rule.mode {
        RuleMode::Threshold { .. } => i64::from(rule.duration_seconds.max(1)),
        RuleMode::Multi { conditions, .. } => conditions
            .iter()
            .map(|c| i64::from(c.duration_seconds))
            .max()
            .unwrap_or(0)
            .max(1),
        RuleMode::Anomaly { .. } => anomaly_window.as_secs() as i64,
    };
    // Slack so a reading exactly on the window boundary is fetched.
    ChronoDuration::seconds(secs + 5)
}

async fn rule_pass(
    pool: &PgPool,
    tenant: &str,
    config: &EvaluatorConfig,
    metrics: &EvaluatorMetrics,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let rules = gp_store::rules::enabled_rules(pool, tenant).await?;
    if rules.is_empty() {
        return Ok(());
    }
    let sites = gp_store::devices::device_sites(pool, tenant).await?;
    let active = gp_store::telemetry::active_devices_since(
        pool,
        tenant,
        now - ChronoDuration::seconds(config.anomaly_window.as_secs() as i64),
    )
    .await?;

    for device_id in &active {
        let site_id = sites.get(device_id).map(String::as_str).unwrap_or_default();
        for rule in &rules {
            if !rule.device_scope.includes(device_id, site_id) {
                continue;
            }

            let lookback = rule_lookback(rule, config.anomaly_window);
            let mut by_metric: HashMap<String, Vec<Reading>> = HashMap::new();
            for metric in rule_metrics(&rule.mode) {
                let readings = if rule.duration_seconds == 0
                    && matches!(rule.mode, RuleMode::Threshold { .. })
                {
                    gp_store::telemetry::latest_reading(pool, tenant, device_id, metric)
                        .await?
                        .into_iter()
                        .collect()
                } else {
                    gp_store::telemetry::readings_since(
                        pool,
                        tenant,
                        device_id,
                        metric,
                        now - lookback,
                    )
                    .await?
                };
                by_metric.insert(metric.to_string(), readings);
            }
            let anomaly_series = match &rule.mode {
                RuleMode::Anomaly { metric, .. } => {
                    by_metric.get(metric.as_str()).cloned().unwrap_or_default()
                }
                _ => Vec::new(),
            };

            let fires = rule_fires(
                &rule.mode,
                rule.duration_seconds,
                &by_metric,
                &anomaly_series,
                now,
            );
            apply_alert_transition(pool, tenant, device_id, rule, fires, metrics, now).await?;
        }
    }
    Ok(())
}

/// Open, refresh, or close the alert for one (rule, device) pair.
///
/// The fingerprint is computed once and used for both the open and the
/// close path, so the close always matches the open byte for byte.
async fn apply_alert_transition(
    pool: &PgPool,
    tenant: &str,
    device_id: &str,
    rule: &AlertRule,
    fires: bool,
    metrics: &EvaluatorMetrics,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let fingerprint = rule_fingerprint(rule.rule_id, device_id);
    let open = gp_store::alerts::find_open(pool, tenant, &fingerprint).await?;

    match (fires, open) {
        (true, None) => {
            gp_store::alerts::insert_open(
                pool,
                tenant,
                device_id,
                Some(rule.rule_id),
                AlertType::Rule,
                rule.severity,
                &fingerprint,
                &rule_summary(&rule.mode, device_id),
                now,
            )
            .await?;
            metrics.alerts_opened_total.inc();
            tracing::info!(tenant, device = device_id, fingerprint, "alert opened");
        }
        (true, Some(existing)) => {
            gp_store::alerts::touch_open(pool, tenant, existing.alert_id, rule.severity, now)
                .await?;
        }
        (false, Some(_)) => {
            if gp_store::alerts::close_open(pool, tenant, &fingerprint, now).await? {
                metrics.alerts_closed_total.inc();
                tracing::info!(tenant, device = device_id, fingerprint, "alert closed");
            }
        }
        (false, None) => {}
    }
    Ok(())
}

/// Wake/poll loop.
///
/// Wakes on telemetry change notifications (debounced 500 ms to collapse
/// bursts) and on the fallback tick; each wake evaluates the affected
/// tenants, the tick evaluates all of them.
pub async fn run(
    pool: PgPool,
    bus: Arc<dyn Bus>,
    config: EvaluatorConfig,
    metrics: EvaluatorMetrics,
    cancel: CancellationToken,
) {
    let mut consumer = match bus
        .pull_consumer(
            StreamKind::Telemetry,
            "evaluator-wake",
            &StreamKind::Telemetry.filter_all(),
        )
        .await
    {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "wake consumer unavailable, falling back to polling only");
            None
        }
    };

    let mut ticker = tokio::time::interval(config.fallback_poll);
    tracing::info!("evaluator started");

    loop {
        let tenants: BTreeSet<String> = tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match gp_store::tenants::active_tenants(&pool).await {
                    Ok(list) => list.into_iter().collect(),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to list tenants");
                        continue;
                    }
                }
            }
            changed = wake_tenants(&mut consumer, config.debounce) => {
                if changed.is_empty() {
                    continue;
                }
                changed
            }
        };

        for tenant in tenants {
            if let Err(e) = evaluate_tenant(&pool, &tenant, &config, &metrics, Utc::now()).await {
                tracing::error!(tenant = %tenant, error = %e, "tenant evaluation failed");
            }
            if cancel.is_cancelled() {
                break;
            }
        }
    }
    tracing::info!("evaluator stopped");
}

/// Collect the set of tenants with new telemetry, debouncing bursts.
/// Pends forever when no wake consumer could be bound (poll-only mode).
async fn wake_tenants(
    consumer: &mut Option<Box<dyn gp_bus::BusConsumer>>,
    debounce: Duration,
) -> BTreeSet<String> {
    let Some(consumer) = consumer.as_mut() else {
        return std::future::pending().await;
    };

    let mut tenants = BTreeSet::new();
    match consumer.fetch(64, Duration::from_millis(500)).await {
        Ok(batch) if !batch.is_empty() => {
            collect(&mut tenants, batch).await;
            // Collapse the burst before evaluating.
            tokio::time::sleep(debounce).await;
            if let Ok(more) = consumer.fetch(256, Duration::from_millis(10)).await {
                collect(&mut tenants, more).await;
            }
        }
        Ok(_) => {
            // Idle pacing for consumers whose fetch returns immediately.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "wake fetch failed");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    tenants
}

async fn collect(tenants: &mut BTreeSet<String>, batch: Vec<gp_bus::BusMessage>) {
    for msg in batch {
        if let Some(tenant) = tenant_of_subject(&msg.subject) {
            tenants.insert(tenant.to_string());
        }
        // Wake notifications are best-effort; ack regardless.
        let _ = msg.ack().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gp_protocol::{CmpOp, DeviceScope, Severity};
    use uuid::Uuid;

    fn rule_with(mode: RuleMode, duration: u32) -> AlertRule {
        AlertRule {
            rule_id: Uuid::nil(),
            tenant: "acme".into(),
            severity: Severity::Warning,
            enabled: true,
            device_scope: DeviceScope::All,
            duration_seconds: duration,
            mode,
            escalation_policy_id: None,
        }
    }

    #[test]
    fn lookback_covers_rule_windows() {
        let anomaly_window = Duration::from_secs(3600);

        let threshold = rule_with(
            RuleMode::Threshold {
                metric: "t".into(),
                op: CmpOp::Gt,
                threshold: 1.0,
            },
            60,
        );
        assert_eq!(rule_lookback(&threshold, anomaly_window).num_seconds(), 65);

        let multi = rule_with(
            RuleMode::Multi {
                conditions: vec![
                    gp_protocol::Condition {
                        metric: "a".into(),
                        op: CmpOp::Gt,
                        threshold: 0.0,
                        duration_seconds: 120,
                    },
                    gp_protocol::Condition {
                        metric: "b".into(),
                        op: CmpOp::Lt,
                        threshold: 0.0,
                        duration_seconds: 30,
                    },
                ],
                match_kind: gp_protocol::MatchKind::All,
            },
            0,
        );
        assert_eq!(rule_lookback(&multi, anomaly_window).num_seconds(), 125);

        let anomaly = rule_with(
            RuleMode::Anomaly {
                metric: "t".into(),
                sensitivity: 0.5,
            },
            0,
        );
        assert_eq!(rule_lookback(&anomaly, anomaly_window).num_seconds(), 3605);
    }

    #[test]
    fn rule_metrics_lists_all_conditions() {
        let multi = rule_with(
            RuleMode::Multi {
                conditions: vec![
                    gp_protocol::Condition {
                        metric: "a".into(),
                        op: CmpOp::Gt,
                        threshold: 0.0,
                        duration_seconds: 0,
                    },
                    gp_protocol::Condition {
                        metric: "b".into(),
                        op: CmpOp::Lt,
                        threshold: 0.0,
                        duration_seconds: 0,
                    },
                ],
                match_kind: gp_protocol::MatchKind::Any,
            },
            0,
        );
        assert_eq!(rule_metrics(&multi.mode), vec!["a", "b"]);
    }
}
