//! Core domain records for rollcall.
//!
//! This module defines the documents the three components share: invitation
//! codes, attendance records, and the linked subject/guardian pair the
//! notification path resolves recipients from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attendance status recorded for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    /// Subject was present.
    Present,
    /// Subject arrived late.
    Late,
    /// Subject was absent.
    Absent,
    /// Absence covered by an excuse.
    Excused,
}

impl AttendanceStatus {
    /// Human-readable label for notification text.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Late => "Late",
            Self::Absent => "Absent",
            Self::Excused => "Excused",
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Present => write!(f, "present"),
            Self::Late => write!(f, "late"),
            Self::Absent => write!(f, "absent"),
            Self::Excused => write!(f, "excused"),
        }
    }
}

/// A single attendance record.
///
/// `synced` marks whether the write has been acknowledged by the canonical
/// store copy; it transitions `false -> true` exactly once and never back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// Unique identifier (assigned by the store at creation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The subject this record is about.
    pub subject_id: String,

    /// When the attendance was taken.
    pub timestamp: DateTime<Utc>,

    /// Recorded status.
    pub status: AttendanceStatus,

    /// Who recorded it.
    pub recorder_id: String,

    /// Free-form notes.
    pub notes: String,

    /// Whether the record has been reconciled with the canonical copy.
    pub synced: bool,
}

impl AttendanceRecord {
    /// Create a new unsynced record stamped with the current time.
    #[must_use]
    pub fn new(subject_id: impl Into<String>, status: AttendanceStatus, recorder_id: impl Into<String>) -> Self {
        Self {
            id: None,
            subject_id: subject_id.into(),
            timestamp: Utc::now(),
            status,
            recorder_id: recorder_id.into(),
            notes: String::new(),
            synced: false,
        }
    }
}

/// A short-lived, single-use linking code.
///
/// Consumed exactly once, atomically, by [`crate::invitation::InvitationCodeRegistry::redeem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationCode {
    /// Unique identifier (assigned by the store at creation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The 6-character uppercase alphanumeric code value.
    pub code: String,

    /// Subject the code links to.
    pub subject_id: String,

    /// Subject display name, denormalized for the redeeming party's UI.
    pub subject_name: String,

    /// Who issued the code.
    pub issuer_id: String,

    /// Class the subject belongs to.
    pub class_id: String,

    /// When the code was created.
    pub created_at: DateTime<Utc>,

    /// When the code stops being redeemable.
    pub expires_at: DateTime<Utc>,

    /// Whether the code has been consumed.
    pub used: bool,

    /// Who redeemed it, once consumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

impl InvitationCode {
    /// Check whether the code had expired at the given instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// A student record. Holds at most one guardian link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Unique identifier (assigned by the store at creation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name.
    pub name: String,

    /// Class the subject belongs to.
    pub class_id: String,

    /// The linked guardian, if any. Kept symmetric with
    /// [`Guardian::linked_subject_ids`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardian_id: Option<String>,
}

/// A guardian account. Holds a set of linked subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guardian {
    /// Unique identifier (assigned by the store at creation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name.
    pub name: String,

    /// Subjects linked through redeemed invitation codes.
    pub linked_subject_ids: Vec<String>,

    /// Registered push device token, if the guardian has a device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}

/// A recorder (staff) account. Receives excuse-submitted notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recorder {
    /// Unique identifier (assigned by the store at creation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name.
    pub name: String,

    /// Registered push device token, if the recorder has a device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
}
