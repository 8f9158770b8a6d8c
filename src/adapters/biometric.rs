use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use super::{
    CloseOutcome, DeviceAdapter, OpenConfig, OpenOutcome, ReadOutcome, StatusReport, WriteOutcome,
};
use crate::device::{Device, DeviceKind};
use crate::error::AdapterError;

/// One enrolled user. Template bytes never leave the adapter through
/// `list_users`.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub user_name: String,
    pub template: Vec<u8>,
    pub enrolled_at: OffsetDateTime,
}

/// Outcome of a verification against one enrolled user.
#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub verified: bool,
    pub confidence: f64,
}

/// Outcome of a search across all enrolled users.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyOutcome {
    pub identified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub confidence: f64,
}

/// Public view of an enrolled user, with the template stripped.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub user_name: String,
    pub template_bytes: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
}

/// Template store and comparison stub for biometric terminals.
///
/// The comparison is a positional byte-overlap ratio. It is a placeholder
/// with the right shape, not a matcher: real deployments plug in their own.
/// The acceptance threshold is the caller's policy; this adapter only
/// reports confidence.
#[derive(Debug, Default)]
pub struct BiometricAdapter {
    users: Mutex<HashMap<String, HashMap<String, UserRecord>>>,
}

impl BiometricAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or replaces) a user's template on `device_id`.
    pub fn enroll(
        &self,
        device_id: &str,
        user_id: &str,
        user_name: &str,
        template: Vec<u8>,
    ) -> UserSummary {
        let record = UserRecord {
            user_id: user_id.to_owned(),
            user_name: user_name.to_owned(),
            template,
            enrolled_at: OffsetDateTime::now_utc(),
        };
        let summary = summarise(&record);
        self.users
            .lock()
            .expect("biometric store lock poisoned")
            .entry(device_id.to_owned())
            .or_default()
            .insert(user_id.to_owned(), record);
        summary
    }

    /// Compares `template` against one enrolled user.
    ///
    /// # Errors
    ///
    /// Returns an error when the user is not enrolled on the device.
    pub fn authenticate(
        &self,
        device_id: &str,
        user_id: &str,
        template: &[u8],
        threshold: f64,
    ) -> Result<MatchOutcome, AdapterError> {
        let users = self.users.lock().expect("biometric store lock poisoned");
        let record = users
            .get(device_id)
            .and_then(|device_users| device_users.get(user_id))
            .ok_or_else(|| AdapterError::UnknownUser {
                user_id: user_id.to_owned(),
            })?;
        let confidence = template_similarity(&record.template, template);
        Ok(MatchOutcome {
            verified: confidence >= threshold,
            confidence,
        })
    }

    /// Searches every enrolled user on the device for the best match.
    #[must_use]
    pub fn identify(&self, device_id: &str, template: &[u8], threshold: f64) -> IdentifyOutcome {
        let users = self.users.lock().expect("biometric store lock poisoned");
        let best = users
            .get(device_id)
            .into_iter()
            .flat_map(HashMap::values)
            .map(|record| {
                (
                    record.user_id.clone(),
                    template_similarity(&record.template, template),
                )
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((user_id, confidence)) if confidence >= threshold => IdentifyOutcome {
                identified: true,
                user_id: Some(user_id),
                confidence,
            },
            Some((_, confidence)) => IdentifyOutcome {
                identified: false,
                user_id: None,
                confidence,
            },
            None => IdentifyOutcome {
                identified: false,
                user_id: None,
                confidence: 0.0,
            },
        }
    }

    /// Lists enrolled users with templates stripped.
    #[must_use]
    pub fn list_users(&self, device_id: &str) -> Vec<UserSummary> {
        let users = self.users.lock().expect("biometric store lock poisoned");
        let mut summaries: Vec<UserSummary> = users
            .get(device_id)
            .into_iter()
            .flat_map(HashMap::values)
            .map(summarise)
            .collect();
        summaries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        summaries
    }

    /// Deletes one user. Returns whether a record existed.
    pub fn delete_user(&self, device_id: &str, user_id: &str) -> bool {
        self.users
            .lock()
            .expect("biometric store lock poisoned")
            .get_mut(device_id)
            .is_some_and(|device_users| device_users.remove(user_id).is_some())
    }

    fn user_count(&self, device_id: &str) -> usize {
        self.users
            .lock()
            .expect("biometric store lock poisoned")
            .get(device_id)
            .map_or(0, HashMap::len)
    }
}

fn summarise(record: &UserRecord) -> UserSummary {
    UserSummary {
        user_id: record.user_id.clone(),
        user_name: record.user_name.clone(),
        template_bytes: record.template.len(),
        enrolled_at: record.enrolled_at,
    }
}

/// Positional byte-overlap ratio in `[0, 1]`.
fn template_similarity(stored: &[u8], probe: &[u8]) -> f64 {
    if stored.is_empty() && probe.is_empty() {
        return 1.0;
    }
    let longest = stored.len().max(probe.len());
    if longest == 0 {
        return 0.0;
    }
    let matching = stored
        .iter()
        .zip(probe.iter())
        .filter(|(a, b)| a == b)
        .count();
    matching as f64 / longest as f64
}

#[async_trait]
impl DeviceAdapter for BiometricAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Biometric
    }

    async fn discover(&self) -> Result<Vec<Device>, AdapterError> {
        // Terminals are network devices; they arrive via subnet scanning.
        Ok(Vec::new())
    }

    async fn open(
        &self,
        device_id: &str,
        _config: OpenConfig,
    ) -> Result<OpenOutcome, AdapterError> {
        Ok(OpenOutcome {
            device_id: device_id.to_owned(),
            detail: Value::Null,
        })
    }

    async fn close(&self, device_id: &str) -> Result<CloseOutcome, AdapterError> {
        Ok(CloseOutcome {
            device_id: device_id.to_owned(),
            was_open: false,
        })
    }

    async fn write(&self, device_id: &str, _payload: &[u8]) -> Result<WriteOutcome, AdapterError> {
        let _ = device_id;
        Err(AdapterError::UnsupportedOnPlatform {
            operation: "biometric.write".to_owned(),
        })
    }

    async fn read(
        &self,
        device_id: &str,
        _max_bytes: usize,
        _timeout: Duration,
    ) -> Result<ReadOutcome, AdapterError> {
        let _ = device_id;
        Err(AdapterError::UnsupportedOnPlatform {
            operation: "biometric.read".to_owned(),
        })
    }

    async fn status(&self, device_id: &str) -> Result<StatusReport, AdapterError> {
        let mut detail = BTreeMap::new();
        detail.insert(
            "enrolled_users".to_owned(),
            Value::from(self.user_count(device_id)),
        );
        Ok(StatusReport {
            device_id: device_id.to_owned(),
            is_open: false,
            detail,
        })
    }
}
