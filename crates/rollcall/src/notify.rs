//! Push notification dispatch.
//!
//! [`PushNotificationDispatcher`] resolves the recipient for an event
//! (subject -> linked guardian -> device token, or recorder -> device token),
//! builds the gateway message, and posts it with a bearer token from
//! [`AccessTokenProvider`]. Recipient resolution failures are typed so
//! callers can tell "no guardian yet" from "guardian has no device".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{AttendanceStatus, Guardian, Recorder, Subject};
use crate::store::{collections, from_doc, DocumentStore};
use crate::token::AccessTokenProvider;

/// Date rendering used in notification bodies, e.g. `August 28, 2026`.
const DATE_FORMAT: &str = "%B %d, %Y";

/// Structured payload attached to a push message.
///
/// Every field is a string; push data blocks do not carry typed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationData {
    /// An attendance record was written for a linked subject.
    AttendanceUpdate {
        /// Subject the record is about.
        subject_id: String,
        /// Subject display name.
        subject_name: String,
        /// Recorded status, lowercase.
        status: String,
        /// Formatted record date.
        date: String,
    },
    /// A guardian submitted an excuse for an absence.
    ExcuseSubmitted {
        /// Subject display name.
        subject_name: String,
        /// Formatted absence date.
        date: String,
    },
}

/// The push gateway as a trait, so tests capture messages without a network.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Deliver one message, authenticated with the given bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotificationFailed`] on a non-200 response.
    async fn send(&self, bearer_token: &str, message: &Value) -> Result<()>;
}

/// HTTP push gateway.
#[derive(Debug)]
pub struct HttpPushGateway {
    client: reqwest::Client,
    url: String,
}

impl HttpPushGateway {
    /// Create a gateway client for the given send URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, bearer_token: &str, message: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(bearer_token)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::NotificationFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Seam the sync engine sends attendance notifications through.
#[async_trait]
pub trait AttendanceNotifier: Send + Sync {
    /// Notify the subject's linked guardian of a new attendance record.
    ///
    /// # Errors
    ///
    /// Returns a recipient-resolution or delivery error.
    async fn send_attendance_update(
        &self,
        subject_id: &str,
        subject_name: &str,
        status: AttendanceStatus,
        date: DateTime<Utc>,
    ) -> Result<()>;
}

/// Resolves recipients and posts push messages to the gateway.
pub struct PushNotificationDispatcher {
    store: Arc<dyn DocumentStore>,
    tokens: AccessTokenProvider,
    gateway: Arc<dyn PushGateway>,
}

impl std::fmt::Debug for PushNotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushNotificationDispatcher")
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

impl PushNotificationDispatcher {
    /// Create a dispatcher over the given store, token provider and gateway.
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        tokens: AccessTokenProvider,
        gateway: Arc<dyn PushGateway>,
    ) -> Self {
        Self {
            store,
            tokens,
            gateway,
        }
    }

    /// Notify the subject's linked guardian of a new attendance record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoLinkedRecipient`] if the subject has no guardian,
    /// [`Error::NoDeliveryTarget`] if the guardian has no device token, and
    /// [`Error::NotificationFailed`] if the gateway rejects the message.
    pub async fn send_attendance_update(
        &self,
        subject_id: &str,
        subject_name: &str,
        status: AttendanceStatus,
        date: DateTime<Utc>,
    ) -> Result<()> {
        let device_token = self.guardian_device_token(subject_id).await?;
        let date_text = date.format(DATE_FORMAT).to_string();

        let title = "Attendance Update";
        let body = format!("{subject_name} marked {} on {date_text}", status.label());
        let data = NotificationData::AttendanceUpdate {
            subject_id: subject_id.to_string(),
            subject_name: subject_name.to_string(),
            status: status.to_string(),
            date: date_text,
        };

        self.deliver(&device_token, title, &body, &data).await?;
        info!(subject_id, %status, "attendance notification delivered");
        Ok(())
    }

    /// Notify a recorder that a guardian submitted an excuse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDeliveryTarget`] if the recorder has no device
    /// token, and [`Error::NotificationFailed`] if the gateway rejects the
    /// message.
    pub async fn send_excuse_submitted(
        &self,
        recorder_id: &str,
        subject_name: &str,
        date: DateTime<Utc>,
    ) -> Result<()> {
        let doc = self
            .store
            .get(collections::RECORDERS, recorder_id)
            .await?
            .ok_or_else(|| Error::not_found("recorder", recorder_id))?;
        let recorder: Recorder = from_doc(doc)?;
        let device_token = recorder.device_token.ok_or_else(|| Error::NoDeliveryTarget {
            recipient_id: recorder_id.to_string(),
        })?;

        let date_text = date.format(DATE_FORMAT).to_string();
        let title = "Excuse Submitted";
        let body = format!("An excuse was submitted for {subject_name} on {date_text}");
        let data = NotificationData::ExcuseSubmitted {
            subject_name: subject_name.to_string(),
            date: date_text,
        };

        self.deliver(&device_token, title, &body, &data).await?;
        info!(recorder_id, "excuse notification delivered");
        Ok(())
    }

    /// Resolve subject -> linked guardian -> device token.
    async fn guardian_device_token(&self, subject_id: &str) -> Result<String> {
        let doc = self
            .store
            .get(collections::SUBJECTS, subject_id)
            .await?
            .ok_or_else(|| Error::not_found("subject", subject_id))?;
        let subject: Subject = from_doc(doc)?;

        let guardian_id = subject.guardian_id.ok_or_else(|| Error::NoLinkedRecipient {
            subject_id: subject_id.to_string(),
        })?;

        let doc = self
            .store
            .get(collections::GUARDIANS, &guardian_id)
            .await?
            .ok_or_else(|| Error::not_found("guardian", &guardian_id))?;
        let guardian: Guardian = from_doc(doc)?;

        guardian.device_token.ok_or(Error::NoDeliveryTarget {
            recipient_id: guardian_id,
        })
    }

    /// Build the gateway message and post it with a fresh or cached token.
    async fn deliver(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: &NotificationData,
    ) -> Result<()> {
        let message = json!({
            "message": {
                "token": device_token,
                "notification": {
                    "title": title,
                    "body": body,
                },
                "data": serde_json::to_value(data)?,
                "android": {
                    "priority": "high",
                    "notification": { "sound": "default" },
                },
            }
        });

        let bearer = self.tokens.access_token().await?;
        debug!(title, "posting push message");
        self.gateway.send(&bearer, &message).await
    }
}

#[async_trait]
impl AttendanceNotifier for PushNotificationDispatcher {
    async fn send_attendance_update(
        &self,
        subject_id: &str,
        subject_name: &str,
        status: AttendanceStatus,
        date: DateTime<Utc>,
    ) -> Result<()> {
        Self::send_attendance_update(self, subject_id, subject_name, status, date).await
    }
}
