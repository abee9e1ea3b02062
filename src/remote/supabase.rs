//! Supabase REST implementation
//!
//! - Bookings: PostgREST table `bookings` filtered by `user_id`
//! - Recordings: Storage bucket `videos`, uploaded with `x-upsert: true`
//! - Metadata: PostgREST table `videos`
//!
//! Authentication uses the service key in both the `apikey` and
//! `Authorization: Bearer` headers.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{BookingSource, MetadataStore, ObjectStore, VideoRecord};
use crate::core::{Booking, SourceError, UploadError};

/// Supabase connection settings
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    /// Service role key
    pub service_key: String,
    /// Owner of the bookings and recordings
    pub user_id: String,
    pub bookings_table: String,
    pub videos_table: String,
    pub bucket: String,
    /// Timeout for table queries
    pub request_timeout: Duration,
    /// Timeout for recording uploads
    pub upload_timeout: Duration,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_key: String::new(),
            user_id: String::new(),
            bookings_table: "bookings".to_string(),
            videos_table: "videos".to_string(),
            bucket: "videos".to_string(),
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(600),
        }
    }
}

/// Client for the Supabase project holding bookings and recordings
pub struct SupabaseClient {
    config: SupabaseConfig,
    http: Client,
}

#[derive(Serialize)]
struct VideoRow<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    record: &'a VideoRecord,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        info!("Supabase client for {} (user {})", config.url, config.user_id);
        Ok(Self { config, http })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url.trim_end_matches('/'), table)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.config.url.trim_end_matches('/'),
            self.config.bucket,
            key
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.service_key)
            .bearer_auth(&self.config.service_key)
    }

    async fn fetch_bookings(&self, filters: &[(&str, String)]) -> Result<Vec<Booking>, SourceError> {
        let mut query = vec![
            ("select", "id,date,start_time,end_time".to_string()),
            ("user_id", format!("eq.{}", self.config.user_id)),
            ("order", "date.asc,start_time.asc".to_string()),
        ];
        query.extend(filters.iter().map(|(k, v)| (*k, v.clone())));

        let response = self
            .authorized(self.http.get(self.rest_url(&self.config.bookings_table)))
            .query(&query)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let response = check_source(response).await?;

        response
            .json::<Vec<Booking>>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}

async fn check_source(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Rejected {
        status: status.as_u16(),
        body,
    })
}

async fn check_upload(response: Response) -> Result<Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UploadError::Rejected {
        status: status.as_u16(),
        body,
    })
}

fn content_type(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("h264") => "video/h264",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl BookingSource for SupabaseClient {
    async fn active_bookings(&self, now: NaiveDateTime) -> Result<Vec<Booking>, SourceError> {
        // Yesterday's bookings may run past midnight
        let today = now.date();
        let yesterday = today - ChronoDuration::days(1);
        let bookings = self
            .fetch_bookings(&[("date", format!("in.({},{})", yesterday, today))])
            .await?;

        let active: Vec<Booking> = bookings.into_iter().filter(|b| b.is_active_at(now)).collect();
        debug!("{} active booking(s) at {}", active.len(), now);
        Ok(active)
    }

    async fn delete_booking(&self, id: &str) -> Result<(), SourceError> {
        let response = self
            .authorized(self.http.delete(self.rest_url(&self.config.bookings_table)))
            .query(&[
                ("id", format!("eq.{}", id)),
                ("user_id", format!("eq.{}", self.config.user_id)),
            ])
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        check_source(response).await?;
        info!("Deleted booking {}", id);
        Ok(())
    }

    async fn expired_bookings(&self, cutoff: NaiveDateTime) -> Result<Vec<Booking>, SourceError> {
        let bookings = self
            .fetch_bookings(&[("date", format!("lte.{}", cutoff.date()))])
            .await?;
        Ok(bookings.into_iter().filter(|b| b.ended_before(cutoff)).collect())
    }
}

#[async_trait]
impl ObjectStore for SupabaseClient {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), UploadError> {
        let size = data.len();
        let response = self
            .authorized(self.http.post(self.object_url(key)))
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type(key))
            .body(data)
            .timeout(self.config.upload_timeout)
            .send()
            .await?;
        check_upload(response).await?;
        info!("Uploaded {} ({} bytes)", key, size);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SupabaseClient {
    async fn insert_video_record(&self, record: &VideoRecord) -> Result<(), UploadError> {
        let row = VideoRow {
            user_id: &self.config.user_id,
            record,
        };
        let response = self
            .authorized(self.http.post(self.rest_url(&self.config.videos_table)))
            .header("Prefer", "return=minimal")
            .json(&row)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        check_upload(response).await?;
        debug!("Registered {}", record.storage_key);
        Ok(())
    }
}
