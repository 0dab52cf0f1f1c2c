//! Escalation timeline with on-call resolution: level advances produce
//! idempotent notification jobs to the correct responder.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use gp_orchestrator::{MemorySink, NotificationSink, next_escalation_at, resolve_recipients};
use gp_protocol::{
    EscalationAction, EscalationLevel, EscalationPolicy, NotificationJob, OncallSchedule, Rotation,
    Severity,
};

fn schedule() -> OncallSchedule {
    OncallSchedule {
        schedule_id: Uuid::nil(),
        tenant: "acme".into(),
        rotations: vec![Rotation {
            starts_at: "2026-02-17T00:00:00Z".parse().unwrap(),
            cadence_hours: 24,
            users: vec!["u1".into(), "u2".into()],
        }],
    }
}

fn policy(schedule_id: Uuid) -> EscalationPolicy {
    EscalationPolicy {
        policy_id: Uuid::nil(),
        tenant: "acme".into(),
        levels: vec![
            EscalationLevel {
                delay_seconds: 0,
                action: EscalationAction::Oncall { schedule_id },
            },
            EscalationLevel {
                delay_seconds: 3600,
                action: EscalationAction::Oncall { schedule_id },
            },
        ],
    }
}

/// One escalation step: resolve the level's action at `now`, produce the
/// job unless its (alert, level) key was already produced, return when
/// the next level fires.
async fn step(
    alert_id: Uuid,
    level: i32,
    policy: &EscalationPolicy,
    schedule: &OncallSchedule,
    produced: &mut HashSet<(Uuid, i32)>,
    sink: &MemorySink,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let action = &policy.levels.get(level as usize)?.action;
    let (recipients, webhook_url) = resolve_recipients(action, Some(schedule), now);

    if produced.insert((alert_id, level)) {
        sink.produce(&NotificationJob {
            tenant: "acme".into(),
            alert_id,
            escalation_level: level,
            severity: Severity::Critical,
            summary: "temperature critical".into(),
            recipients,
            webhook_url,
            produced_at: now,
        })
        .await
        .unwrap();
    }
    next_escalation_at(policy, level, now)
}

/// Alert opened 2026-02-17T12:00Z with levels [{delay 0}, {delay 3600}]:
/// notification at 12:00 to u1, at 13:00 to u1 again (same rotation day).
#[tokio::test]
async fn escalation_timeline_notifies_the_responder_on_duty() {
    let schedule = schedule();
    let policy = policy(schedule.schedule_id);
    let sink = MemorySink::new();
    let mut produced = HashSet::new();
    let alert_id = Uuid::now_v7();

    let opened_at: DateTime<Utc> = "2026-02-17T12:00:00Z".parse().unwrap();

    // First tick at open time fires level 0 immediately.
    let next = step(alert_id, 0, &policy, &schedule, &mut produced, &sink, opened_at)
        .await
        .expect("a second level exists");
    assert_eq!(next, "2026-02-17T13:00:00Z".parse::<DateTime<Utc>>().unwrap());

    // Second tick an hour later fires level 1; the policy is then done.
    let done = step(alert_id, 1, &policy, &schedule, &mut produced, &sink, next).await;
    assert!(done.is_none(), "no further levels after the last one");

    let jobs = sink.jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].escalation_level, 0);
    assert_eq!(jobs[0].recipients, vec!["u1"]);
    assert_eq!(jobs[1].escalation_level, 1);
    assert_eq!(jobs[1].recipients, vec!["u1"], "still the same rotation day");
}

/// Re-processing the same (alert, level) does not double-produce.
#[tokio::test]
async fn escalation_production_is_idempotent() {
    let schedule = schedule();
    let policy = policy(schedule.schedule_id);
    let sink = MemorySink::new();
    let mut produced = HashSet::new();
    let alert_id = Uuid::now_v7();
    let now: DateTime<Utc> = "2026-02-17T12:00:00Z".parse().unwrap();

    for _ in 0..3 {
        step(alert_id, 0, &policy, &schedule, &mut produced, &sink, now).await;
    }
    assert_eq!(sink.jobs().len(), 1);
}

/// The rotation hands over at midnight UTC.
#[tokio::test]
async fn responder_changes_across_rotation_boundaries() {
    let schedule = schedule();
    let action = EscalationAction::Oncall {
        schedule_id: schedule.schedule_id,
    };
    let at = |t: &str| resolve_recipients(&action, Some(&schedule), t.parse().unwrap()).0;

    assert_eq!(at("2026-02-17T12:00:00Z"), vec!["u1"]);
    assert_eq!(at("2026-02-18T00:00:00Z"), vec!["u2"]);
    assert_eq!(at("2026-02-18T23:59:59Z"), vec!["u2"]);
    assert_eq!(at("2026-02-19T00:00:00Z"), vec!["u1"]);
}
