//! Staff record storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{Staff, StaffFilter};

/// Persistence for staff records.
///
/// Implementations enforce email uniqueness on insert.
#[async_trait]
pub trait StaffStore: Send + Sync {
    /// Insert a new record. Returns `false` if the email is taken.
    async fn insert(&self, staff: Staff) -> bool;

    async fn get(&self, id: Uuid) -> Option<Staff>;

    async fn find_by_email(&self, email: &str) -> Option<Staff>;

    /// Matching records in creation order, skipping `offset`, at most `limit`,
    /// plus the total match count.
    async fn list(&self, filter: &StaffFilter, offset: usize, limit: usize) -> (Vec<Staff>, usize);

    /// Replace an existing record. Returns `false` if it does not exist.
    async fn update(&self, staff: Staff) -> bool;

    async fn delete(&self, id: Uuid) -> Option<Staff>;
}

/// In-memory staff store.
pub struct InMemoryStaffStore {
    records: RwLock<HashMap<Uuid, Staff>>,
}

impl InMemoryStaffStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryStaffStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StaffStore for InMemoryStaffStore {
    async fn insert(&self, staff: Staff) -> bool {
        let mut records = self.records.write().await;
        if records.values().any(|s| s.email.eq_ignore_ascii_case(&staff.email)) {
            return false;
        }
        records.insert(staff.id, staff);
        true
    }

    async fn get(&self, id: Uuid) -> Option<Staff> {
        self.records.read().await.get(&id).cloned()
    }

    async fn find_by_email(&self, email: &str) -> Option<Staff> {
        self.records
            .read()
            .await
            .values()
            .find(|s| s.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    async fn list(&self, filter: &StaffFilter, offset: usize, limit: usize) -> (Vec<Staff>, usize) {
        let records = self.records.read().await;
        let mut matching: Vec<&Staff> = records.values().filter(|s| filter.matches(s)).collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    async fn update(&self, staff: Staff) -> bool {
        let mut records = self.records.write().await;
        if !records.contains_key(&staff.id) {
            return false;
        }
        records.insert(staff.id, staff);
        true
    }

    async fn delete(&self, id: Uuid) -> Option<Staff> {
        self.records.write().await.remove(&id)
    }
}
