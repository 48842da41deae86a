use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::detect::{AlertCategory, AnomalyFinding, Emission, FindingSource, NewAlert};
use crate::storage::AlertStore;

/// Turn a finding into the alert row that would be written for it.
pub fn compose_alert(finding: &AnomalyFinding, triggered_at: DateTime<Utc>) -> NewAlert {
    let name = &finding.sensor_name;
    let (category, title, description) = match finding.source {
        FindingSource::StatusError => (
            AlertCategory::FacilityError,
            format!("{} is not operational", name),
            format!(
                "{} is not operating normally. Immediate inspection is required.",
                name
            ),
        ),
        FindingSource::Statistical => {
            let direction = if finding.z_score > 0.0 { "increase" } else { "decrease" };
            (
                AlertCategory::Anomaly,
                format!("Abnormal pattern detected on {}", name),
                format!(
                    "Current value: {:.2}, mean: {:.2}, z-score: {:.2}. \
                     An unusual {} compared to the recent baseline was detected.",
                    finding.current_value, finding.mean, finding.z_score, direction
                ),
            )
        }
    };

    NewAlert {
        sensor_id: finding.sensor_id.clone(),
        category,
        severity: finding.severity,
        title,
        description,
        triggered_at,
    }
}

/// Writes alerts for findings, at most one `NEW` alert per sensor per
/// cooldown window.
pub struct AlertEmitter<S> {
    store: Arc<S>,
    cooldown: Duration,
}

impl<S: AlertStore> AlertEmitter<S> {
    pub fn new(store: Arc<S>, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    pub async fn emit(&self, finding: &AnomalyFinding, now: DateTime<Utc>) -> Result<Emission> {
        let alert = compose_alert(finding, now);
        let since = now
            .checked_sub_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.insert_unless_recent(&alert, since).await
    }
}
