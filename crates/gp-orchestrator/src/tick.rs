//! Escalation tick: advance due OPEN alerts through their policies.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use gp_observe::{Counter, write_counter};
use gp_protocol::{EscalationAction, EscalationPolicy, NotificationJob, OncallSchedule};
use gp_store::AdvisoryLock;
use gp_store::alerts::{AlertRow, parse_severity};

use crate::config::OrchestratorConfig;
use crate::sink::NotificationSink;

#[derive(Clone, Default)]
pub struct OrchestratorMetrics {
    pub ticks_total: Counter,
    pub escalations_total: Counter,
    pub notifications_produced_total: Counter,
    pub escalation_errors_total: Counter,
}

impl OrchestratorMetrics {
    pub fn render(&self) -> String {
        let mut buf = String::with_capacity(512);
        write_counter(
            &mut buf,
            "gp_orchestrator_ticks_total",
            "Escalation ticks completed.",
            &self.ticks_total,
        );
        write_counter(
            &mut buf,
            "gp_orchestrator_escalations_total",
            "Alert escalation levels advanced.",
            &self.escalations_total,
        );
        write_counter(
            &mut buf,
            "gp_orchestrator_notifications_produced_total",
            "Notification jobs handed to the sink.",
            &self.notifications_produced_total,
        );
        write_counter(
            &mut buf,
            "gp_orchestrator_escalation_errors_total",
            "Alerts whose escalation processing failed.",
            &self.escalation_errors_total,
        );
        buf
    }
}

/// When the level after `new_level` fires, if the policy has one.
pub fn next_escalation_at(
    policy: &EscalationPolicy,
    new_level: i32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    policy
        .levels
        .get((new_level + 1) as usize)
        .map(|level| now + ChronoDuration::seconds(i64::from(level.delay_seconds)))
}

/// Recipients for a level's action. On-call actions resolve the current
/// responder from the schedule's rotations at `now`.
pub fn resolve_recipients(
    action: &EscalationAction,
    schedule: Option<&OncallSchedule>,
    now: DateTime<Utc>,
) -> (Vec<String>, Option<String>) {
    match action {
        EscalationAction::NotifyUsers { users } => (users.clone(), None),
        EscalationAction::Oncall { .. } => {
            let responder = schedule
                .and_then(|s| s.responder_at(now))
                .map(String::from);
            (responder.into_iter().collect(), None)
        }
        EscalationAction::Webhook { url } => (Vec::new(), Some(url.clone())),
    }
}

/// Process every due alert once. Claimed via a global advisory lock so a
/// second orchestrator instance skips the tick entirely.
pub async fn tick(
    pool: &PgPool,
    sink: &dyn NotificationSink,
    config: &OrchestratorConfig,
    metrics: &OrchestratorMetrics,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let Some(lock) = AdvisoryLock::try_acquire(pool, "orchestrator:tick").await? else {
        tracing::debug!("another orchestrator holds the tick lock");
        return Ok(());
    };

    let due = gp_store::alerts::due_escalations(pool, now, config.batch_limit).await?;
    for alert in due {
        if let Err(e) = escalate_alert(pool, sink, &alert, metrics, now).await {
            metrics.escalation_errors_total.inc();
            tracing::error!(
                alert_id = %alert.alert_id,
                tenant = %alert.tenant,
                error = %e,
                "escalation failed, will retry next tick"
            );
        }
    }

    lock.release().await?;
    metrics.ticks_total.inc();
    Ok(())
}

async fn escalate_alert(
    pool: &PgPool,
    sink: &dyn NotificationSink,
    alert: &AlertRow,
    metrics: &OrchestratorMetrics,
    now: DateTime<Utc>,
) -> Result<(), EscalationFailure> {
    // 1. Resolve the rule's policy; alerts without one stop escalating.
    let policy_id = match alert.rule_id {
        Some(rule_id) => {
            gp_store::rules::escalation_policy_id(pool, &alert.tenant, rule_id).await?
        }
        None => None,
    };
    let policy = match policy_id {
        Some(id) => gp_store::escalation::fetch_policy(pool, &alert.tenant, id).await?,
        None => None,
    };
    let Some(policy) = policy else {
        gp_store::alerts::set_escalation(
            pool,
            &alert.tenant,
            alert.alert_id,
            alert.escalation_level,
            None,
        )
        .await?;
        return Ok(());
    };

    // 2. Advance one level.
    let new_level = alert.escalation_level + 1;
    let Some(level) = policy.levels.get(new_level as usize) else {
        // Policy exhausted.
        gp_store::alerts::set_escalation(
            pool,
            &alert.tenant,
            alert.alert_id,
            alert.escalation_level,
            None,
        )
        .await?;
        return Ok(());
    };

    // 3. Resolve recipients, fetching the schedule for on-call actions.
    let schedule = match &level.action {
        EscalationAction::Oncall { schedule_id } => {
            gp_store::escalation::fetch_schedule(pool, &alert.tenant, *schedule_id).await?
        }
        _ => None,
    };
    let (recipients, webhook_url) = resolve_recipients(&level.action, schedule.as_ref(), now);

    // 4. Produce the job, then record it. Producing first keeps the
    //    at-least-once guarantee across a crash between the two steps;
    //    the (alert_id, level) key lets consumers dedupe.
    let job = NotificationJob {
        tenant: alert.tenant.clone(),
        alert_id: alert.alert_id,
        escalation_level: new_level,
        severity: parse_severity(&alert.severity),
        summary: alert.summary.clone(),
        recipients,
        webhook_url,
        produced_at: now,
    };
    sink.produce(&job).await.map_err(EscalationFailure::Sink)?;
    metrics.notifications_produced_total.inc();
    gp_store::escalation::record_notification(pool, &job, now).await?;

    // 5. Schedule the next level.
    let next_at = next_escalation_at(&policy, new_level, now);
    gp_store::alerts::set_escalation(pool, &alert.tenant, alert.alert_id, new_level, next_at)
        .await?;
    metrics.escalations_total.inc();

    tracing::info!(
        alert_id = %alert.alert_id,
        tenant = %alert.tenant,
        level = new_level,
        recipients = job.recipients.len(),
        "alert escalated"
    );
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum EscalationFailure {
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Sink(crate::sink::NotificationError),
}

/// Tick loop until cancelled.
pub async fn run(
    pool: PgPool,
    sink: Arc<dyn NotificationSink>,
    config: OrchestratorConfig,
    metrics: OrchestratorMetrics,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(interval = ?config.tick_interval, "orchestrator started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tick(&pool, &*sink, &config, &metrics, Utc::now()).await {
                    tracing::error!(error = %e, "escalation tick failed");
                }
            }
            () = cancel.cancelled() => break,
        }
    }
    tracing::info!("orchestrator stopped");
}
