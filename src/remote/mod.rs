//! Remote collaborators
//!
//! The orchestrator talks to three external services, each behind a trait:
//! - [`BookingSource`]: scheduled recording windows, deleted once processed
//! - [`ObjectStore`]: blob storage for finished recordings
//! - [`MetadataStore`]: one record per uploaded recording
//!
//! [`SupabaseClient`] implements all three over the Supabase REST APIs;
//! the in-memory implementations back tests and the synthetic camera mode.

mod memory;
mod supabase;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{select_active, Booking, SourceError, UploadError};

pub use memory::{MemoryBookingSource, MemoryMetadataStore, MemoryObjectStore};
pub use supabase::{SupabaseClient, SupabaseConfig};

/// Source of booking windows
#[async_trait]
pub trait BookingSource: Send + Sync {
    /// Every booking whose window contains `now` (normally zero or one)
    async fn active_bookings(&self, now: NaiveDateTime) -> Result<Vec<Booking>, SourceError>;

    /// The booking that should be recording at `now`
    async fn get_active_booking(&self, now: NaiveDateTime) -> Result<Option<Booking>, SourceError> {
        let bookings = self.active_bookings(now).await?;
        Ok(select_active(&bookings, now).cloned())
    }

    /// Remove a fully processed booking. Deleting a missing booking is not an error.
    async fn delete_booking(&self, id: &str) -> Result<(), SourceError>;

    /// Bookings whose window closed before `cutoff`
    async fn expired_bookings(&self, cutoff: NaiveDateTime) -> Result<Vec<Booking>, SourceError>;
}

/// Blob storage for recordings
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, overwriting any previous object
    async fn put(&self, key: &str, data: Bytes) -> Result<(), UploadError>;
}

/// Metadata about uploaded recordings
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_video_record(&self, record: &VideoRecord) -> Result<(), UploadError>;
}

/// Metadata row for one uploaded recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub filename: String,
    #[serde(rename = "storage_path")]
    pub storage_key: String,
    pub booking_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Object key for a user's recording: `{user_id}/{filename}`
pub fn storage_key(user_id: &str, filename: &str) -> String {
    format!("{}/{}", user_id, filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn key_is_user_prefixed() {
        assert_eq!(storage_key("u1", "recording_20261019_100000.mp4"), "u1/recording_20261019_100000.mp4");
    }

    #[tokio::test]
    async fn default_selection_picks_earliest() {
        let day = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let t = |h, m| chrono::NaiveTime::from_hms_opt(h, m, 0).unwrap();
        let source = MemoryBookingSource::new(vec![
            Booking::new("late", day, t(10, 2), t(11, 0)),
            Booking::new("early", day, t(10, 0), t(10, 30)),
        ]);

        let now = day.and_time(t(10, 5));
        let active = source.get_active_booking(now).await.unwrap().unwrap();
        assert_eq!(active.id, "early");
    }

    #[test]
    fn record_uses_storage_path_column() {
        let record = VideoRecord {
            filename: "a.mp4".into(),
            storage_key: "u1/a.mp4".into(),
            booking_id: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["storage_path"], "u1/a.mp4");
    }
}
