//! Usage data model and the client that fetches it
//!
//! A usage snapshot is the decoded body of `GET /organizations/{id}/usage`:
//! up to six optional quota buckets, each with a utilization and an optional
//! reset timestamp.

mod client;
mod traits;

pub use client::{ApiError, UsageClient, BROWSER_USER_AGENT};
pub use traits::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Organization visible to a session secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(rename = "uuid")]
    pub id: String,
    pub name: String,
}

/// One quota window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub utilization: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<String>,
}

impl UsageBucket {
    pub fn percentage(&self) -> u32 {
        percentage(self.utilization)
    }

    /// Parsed reset time; unparseable timestamps count as absent
    pub fn resets_at_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.resets_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|time| time.with_timezone(&Utc))
    }

    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Option<String> {
        format_reset(self.resets_at_time(), now)
    }
}

/// Named buckets, in API key order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    FiveHour,
    SevenDay,
    SevenDayOpus,
    SevenDaySonnet,
    SevenDayCowork,
    SevenDayOauthApps,
}

impl BucketKind {
    pub fn label(&self) -> &'static str {
        match self {
            BucketKind::FiveHour => "Session",
            BucketKind::SevenDay => "Weekly",
            BucketKind::SevenDayOpus => "Weekly (Opus)",
            BucketKind::SevenDaySonnet => "Weekly (Sonnet)",
            BucketKind::SevenDayCowork => "Weekly (Cowork)",
            BucketKind::SevenDayOauthApps => "Weekly (OAuth apps)",
        }
    }
}

/// Decoded usage response. Every bucket is optional and defaults to absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub five_hour: Option<UsageBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day: Option<UsageBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_opus: Option<UsageBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_sonnet: Option<UsageBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_cowork: Option<UsageBucket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_oauth_apps: Option<UsageBucket>,
}

impl UsageSnapshot {
    /// Five-hour window percentage, 0 when the bucket is absent
    pub fn session_percentage(&self) -> u32 {
        self.five_hour.as_ref().map(UsageBucket::percentage).unwrap_or(0)
    }

    /// Seven-day window percentage, 0 when the bucket is absent
    pub fn weekly_percentage(&self) -> u32 {
        self.seven_day.as_ref().map(UsageBucket::percentage).unwrap_or(0)
    }

    /// Present buckets only
    pub fn buckets(&self) -> Vec<(BucketKind, &UsageBucket)> {
        [
            (BucketKind::FiveHour, &self.five_hour),
            (BucketKind::SevenDay, &self.seven_day),
            (BucketKind::SevenDayOpus, &self.seven_day_opus),
            (BucketKind::SevenDaySonnet, &self.seven_day_sonnet),
            (BucketKind::SevenDayCowork, &self.seven_day_cowork),
            (BucketKind::SevenDayOauthApps, &self.seven_day_oauth_apps),
        ]
        .into_iter()
        .filter_map(|(kind, bucket)| bucket.as_ref().map(|bucket| (kind, bucket)))
        .collect()
    }
}

/// `min(round(utilization), 100)`, floored at 0
pub fn percentage(utilization: f64) -> u32 {
    if !utilization.is_finite() {
        return if utilization > 0.0 { 100 } else { 0 };
    }
    utilization.round().clamp(0.0, 100.0) as u32
}

/// Human-readable time until `resets_at`.
///
/// `None` when there is no timestamp, `"now"` once it has passed, otherwise
/// `"{d}d"`, `"{h}h {m}m"` or `"{m}m"`.
pub fn format_reset(resets_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<String> {
    let resets_at = resets_at?;
    let remaining = resets_at.signed_duration_since(now);
    if remaining.num_milliseconds() <= 0 {
        return Some("now".to_string());
    }

    let total_minutes = remaining.num_minutes();
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours >= 24 {
        Some(format!("{}d", hours / 24))
    } else if hours > 0 {
        Some(format!("{}h {}m", hours, minutes))
    } else {
        Some(format!("{}m", minutes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn percentage_rounds_and_caps() {
        assert_eq!(percentage(99.6), 100);
        assert_eq!(percentage(55.4), 55);
        assert_eq!(percentage(55.5), 56);
        assert_eq!(percentage(140.0), 100);
        assert_eq!(percentage(-3.0), 0);
        assert_eq!(percentage(0.0), 0);
    }

    #[test]
    fn format_reset_covers_each_range() {
        let now = Utc::now();
        assert_eq!(
            format_reset(Some(now + Duration::minutes(90)), now).as_deref(),
            Some("1h 30m")
        );
        assert_eq!(
            format_reset(Some(now + Duration::hours(30)), now).as_deref(),
            Some("1d")
        );
        assert_eq!(
            format_reset(Some(now + Duration::minutes(42)), now).as_deref(),
            Some("42m")
        );
        assert_eq!(
            format_reset(Some(now - Duration::minutes(5)), now).as_deref(),
            Some("now")
        );
        assert_eq!(format_reset(None, now), None);
    }

    #[test]
    fn decodes_partial_usage_body() {
        let body = r#"{
            "five_hour": { "utilization": 42.4, "resets_at": "2025-06-01T12:00:00.123456+00:00" },
            "seven_day": { "utilization": 10.0, "resets_at": null },
            "seven_day_opus": null,
            "extra_usage": { "is_enabled": false }
        }"#;
        let snapshot: UsageSnapshot = serde_json::from_str(body).expect("decode");

        assert_eq!(snapshot.session_percentage(), 42);
        assert_eq!(snapshot.weekly_percentage(), 10);
        assert!(snapshot.seven_day_opus.is_none());
        assert!(snapshot.seven_day_cowork.is_none());
        assert_eq!(snapshot.buckets().len(), 2);

        let five_hour = snapshot.five_hour.as_ref().expect("five hour");
        assert!(five_hour.resets_at_time().is_some());
        assert!(snapshot.seven_day.as_ref().expect("seven day").resets_at_time().is_none());
    }

    #[test]
    fn missing_buckets_default_to_zero_percent() {
        let snapshot: UsageSnapshot = serde_json::from_str("{}").expect("decode");
        assert_eq!(snapshot.session_percentage(), 0);
        assert_eq!(snapshot.weekly_percentage(), 0);
        assert!(snapshot.buckets().is_empty());
    }

    #[test]
    fn bucket_without_utilization_is_rejected() {
        let result = serde_json::from_str::<UsageSnapshot>(r#"{"five_hour": {"resets_at": null}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unparseable_reset_time_has_no_display_value() {
        let bucket = UsageBucket {
            utilization: 12.0,
            resets_at: Some("tomorrow-ish".to_string()),
        };
        assert_eq!(bucket.time_until_reset(Utc::now()), None);
    }

    #[test]
    fn organization_reads_uuid_field() {
        let orgs: Vec<Organization> =
            serde_json::from_str(r#"[{"uuid": "org-1", "name": "Acme", "capabilities": []}]"#)
                .expect("decode");
        assert_eq!(orgs[0].id, "org-1");
        assert_eq!(orgs[0].name, "Acme");
    }
}
