//! Escalation policies, on-call schedules, and notification jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a policy level does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationAction {
    /// Notify a fixed set of user identifiers.
    NotifyUsers { users: Vec<String> },
    /// Notify whoever is currently on call for the schedule.
    Oncall { schedule_id: Uuid },
    /// POST the notification to an operator-supplied URL.
    Webhook { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationLevel {
    /// Seconds to wait before the *next* level fires.
    pub delay_seconds: u32,
    pub action: EscalationAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub policy_id: Uuid,
    pub tenant: String,
    /// Ordered; level 0 fires first.
    pub levels: Vec<EscalationLevel>,
}

/// One rotation inside an on-call schedule. All times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub starts_at: DateTime<Utc>,
    pub cadence_hours: u32,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OncallSchedule {
    pub schedule_id: Uuid,
    pub tenant: String,
    pub rotations: Vec<Rotation>,
}

impl OncallSchedule {
    /// Resolve the responder on duty at `now`.
    ///
    /// The active rotation is the first listed one that has started
    /// (first listed wins ties); within it the slot advances every
    /// `cadence_hours`, cycling through `users` in order.
    pub fn responder_at(&self, now: DateTime<Utc>) -> Option<&str> {
        let rotation = self
            .rotations
            .iter()
            .find(|r| r.starts_at <= now && !r.users.is_empty() && r.cadence_hours > 0)?;

        let elapsed = (now - rotation.starts_at).num_seconds();
        let cadence = i64::from(rotation.cadence_hours) * 3600;
        let slot = (elapsed / cadence) as usize % rotation.users.len();
        Some(rotation.users[slot].as_str())
    }
}

/// Notification handoff produced by the orchestrator.
///
/// Idempotency key is `(alert_id, escalation_level)`; the sink contract
/// is at-least-once, so consumers dedupe on that pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub tenant: String,
    pub alert_id: Uuid,
    pub escalation_level: i32,
    pub severity: crate::alerts::Severity,
    pub summary: String,
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub produced_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.alert_id, self.escalation_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(start: &str, cadence_hours: u32, users: &[&str]) -> OncallSchedule {
        OncallSchedule {
            schedule_id: Uuid::nil(),
            tenant: "acme".into(),
            rotations: vec![Rotation {
                starts_at: start.parse().unwrap(),
                cadence_hours,
                users: users.iter().map(|u| u.to_string()).collect(),
            }],
        }
    }

    #[test]
    fn daily_rotation_alternates() {
        let s = schedule("2026-02-17T00:00:00Z", 24, &["u1", "u2"]);
        let at = |t: &str| s.responder_at(t.parse().unwrap());

        assert_eq!(at("2026-02-17T12:00:00Z"), Some("u1"));
        assert_eq!(at("2026-02-18T00:00:00Z"), Some("u2"));
        assert_eq!(at("2026-02-19T00:00:00Z"), Some("u1"));
    }

    #[test]
    fn before_rotation_start_nobody_on_call() {
        let s = schedule("2026-02-17T00:00:00Z", 24, &["u1", "u2"]);
        assert_eq!(
            s.responder_at(Utc.with_ymd_and_hms(2026, 2, 16, 23, 0, 0).unwrap()),
            None
        );
    }

    #[test]
    fn first_listed_rotation_wins() {
        let mut s = schedule("2026-02-01T00:00:00Z", 24, &["primary"]);
        s.rotations.push(Rotation {
            starts_at: "2026-01-01T00:00:00Z".parse().unwrap(),
            cadence_hours: 24,
            users: vec!["secondary".into()],
        });
        assert_eq!(
            s.responder_at("2026-03-01T00:00:00Z".parse().unwrap()),
            Some("primary")
        );
    }

    #[test]
    fn empty_or_zero_cadence_rotation_skipped() {
        let mut s = schedule("2026-02-01T00:00:00Z", 24, &[]);
        assert_eq!(s.responder_at("2026-03-01T00:00:00Z".parse().unwrap()), None);
        s.rotations[0].users = vec!["u1".into()];
        s.rotations[0].cadence_hours = 0;
        assert_eq!(s.responder_at("2026-03-01T00:00:00Z".parse().unwrap()), None);
    }

    #[test]
    fn notification_idempotency_key() {
        let job = NotificationJob {
            tenant: "acme".into(),
            alert_id: Uuid::nil(),
            escalation_level: 2,
            severity: crate::alerts::Severity::Critical,
            summary: "temp high".into(),
            recipients: vec!["u1".into()],
            webhook_url: None,
            produced_at: Utc::now(),
        };
        assert_eq!(
            job.idempotency_key(),
            format!("{}:2", Uuid::nil())
        );
    }
}
