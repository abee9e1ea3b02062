//! In-memory collaborators with failure injection

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{BookingSource, MetadataStore, ObjectStore, VideoRecord};
use crate::core::{Booking, SourceError, UploadError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Consume one injected failure, if any are left
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Booking source backed by a list
#[derive(Default)]
pub struct MemoryBookingSource {
    bookings: Mutex<Vec<Booking>>,
    deleted: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl MemoryBookingSource {
    pub fn new(bookings: Vec<Booking>) -> Self {
        Self {
            bookings: Mutex::new(bookings),
            ..Default::default()
        }
    }

    pub fn insert(&self, booking: Booking) {
        lock(&self.bookings).push(booking);
    }

    /// Withdraw a booking without counting it as released
    pub fn remove(&self, id: &str) {
        lock(&self.bookings).retain(|b| b.id != id);
    }

    /// Ids of bookings deleted so far, in order
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn remaining(&self) -> Vec<Booking> {
        lock(&self.bookings).clone()
    }

    /// Make every call fail as if the source were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), SourceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("booking source offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BookingSource for MemoryBookingSource {
    async fn active_bookings(&self, now: NaiveDateTime) -> Result<Vec<Booking>, SourceError> {
        self.check_online()?;
        Ok(lock(&self.bookings)
            .iter()
            .filter(|b| b.is_active_at(now))
            .cloned()
            .collect())
    }

    async fn delete_booking(&self, id: &str) -> Result<(), SourceError> {
        self.check_online()?;
        lock(&self.bookings).retain(|b| b.id != id);
        lock(&self.deleted).push(id.to_string());
        Ok(())
    }

    async fn expired_bookings(&self, cutoff: NaiveDateTime) -> Result<Vec<Booking>, SourceError> {
        self.check_online()?;
        Ok(lock(&self.bookings)
            .iter()
            .filter(|b| b.ended_before(cutoff))
            .cloned()
            .collect())
    }
}

/// Object store backed by a map
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicU32,
    failures: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` puts
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Successful puts so far
    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), UploadError> {
        if take_failure(&self.failures) {
            return Err(UploadError::Unavailable("injected put failure".to_string()));
        }
        lock(&self.objects).insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Metadata store backed by a list
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Vec<VideoRecord>>,
    failures: AtomicU32,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` inserts
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<VideoRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_video_record(&self, record: &VideoRecord) -> Result<(), UploadError> {
        if take_failure(&self.failures) {
            return Err(UploadError::Unavailable("injected insert failure".to_string()));
        }
        lock(&self.records).push(record.clone());
        Ok(())
    }
}
