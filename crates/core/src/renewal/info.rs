//! Renewal windows.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::acme::{AcmeRenewalInfo, SuggestedWindow};

/// Certificates valid for less than this are short-lived.
pub const SHORT_LIVED_THRESHOLD: Duration = Duration::days(10);

/// Remaining-validity fraction marking the middle of the renewal window.
pub const REMAINING_FRACTION: f64 = 0.333;
pub const SHORT_LIVED_REMAINING_FRACTION: f64 = 0.5;

/// Half-width of the locally computed window.
pub const WINDOW_SPAN: Duration = Duration::hours(24);
pub const SHORT_LIVED_WINDOW_SPAN: Duration = Duration::hours(4);

/// Upper bound (exclusive) of the random seconds added to each window edge.
pub const WINDOW_JITTER_SECS: i64 = 60;

/// When an issued certificate should be renewed.
///
/// Stored per order as JSON. Either copied from the CA's ARI response or
/// computed from the certificate's validity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalInfo {
    pub suggested_window: SuggestedWindow,
    #[serde(
        rename = "explanationURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub explanation_url: Option<String>,
    /// Earliest time the CA wants to be asked again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl RenewalInfo {
    /// Convert a CA response received at `now`. A `Retry-After` too large
    /// to represent is dropped.
    pub fn from_acme(info: AcmeRenewalInfo, now: DateTime<Utc>) -> Self {
        let retry_after = info
            .retry_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay));

        Self {
            suggested_window: info.suggested_window,
            explanation_url: info.explanation_url,
            retry_after,
        }
    }

    /// Local window for a CA without ARI.
    ///
    /// The window is centred where `1/3` of the validity remains (`1/2` for
    /// short-lived certificates) and each edge gets up to a minute of jitter
    /// so renewals of many certificates spread out.
    pub fn heuristic(valid_from: DateTime<Utc>, valid_to: DateTime<Utc>) -> Self {
        let mut rng = rand::rng();
        let start_jitter = Duration::seconds(rng.random_range(0..WINDOW_JITTER_SECS));
        let end_jitter = Duration::seconds(rng.random_range(0..WINDOW_JITTER_SECS));

        let window = heuristic_window(valid_from, valid_to);
        Self {
            suggested_window: SuggestedWindow {
                start: window.start + start_jitter,
                end: window.end + end_jitter,
            },
            explanation_url: None,
            retry_after: None,
        }
    }

    /// Parse stored JSON. Unreadable data or an empty window counts as absent.
    pub fn from_json(data: &str) -> Option<Self> {
        let info: RenewalInfo = serde_json::from_str(data).ok()?;
        if info.suggested_window.start.timestamp() <= 0 || info.suggested_window.end.timestamp() <= 0
        {
            return None;
        }
        Some(info)
    }

    /// Whether the CA should be asked again for fresh information.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.retry_after {
            None => true,
            Some(retry_after) => now > retry_after,
        }
    }

    /// Pick a uniformly random minute inside the window.
    ///
    /// Not stored: every evaluation draws again, so the exact time drifts
    /// between runs but never leaves the window.
    pub fn select_renewal_time(&self) -> DateTime<Utc> {
        let SuggestedWindow { start, end } = self.suggested_window;
        let minutes = (end - start).num_minutes();
        if minutes <= 0 {
            return start;
        }
        start + Duration::minutes(rand::rng().random_range(0..minutes))
    }
}

/// Window without jitter.
fn heuristic_window(valid_from: DateTime<Utc>, valid_to: DateTime<Utc>) -> SuggestedWindow {
    let validity = valid_to - valid_from;
    let short_lived = validity < SHORT_LIVED_THRESHOLD;

    let (fraction, span) = if short_lived {
        (SHORT_LIVED_REMAINING_FRACTION, SHORT_LIVED_WINDOW_SPAN)
    } else {
        (REMAINING_FRACTION, WINDOW_SPAN)
    };

    let remaining = Duration::milliseconds((validity.num_milliseconds() as f64 * fraction) as i64);
    let midpoint = valid_to - remaining;

    SuggestedWindow {
        start: midpoint - span,
        end: midpoint + span,
    }
}
