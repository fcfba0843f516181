//! In-memory login store for the dev monolith and tests

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::LoginStore;

#[derive(Default)]
pub struct MemoryLoginStore {
    logins: DashMap<String, BTreeSet<String>>,
    failing: AtomicBool,
}

impl MemoryLoginStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed login records, bypassing the trait
    pub fn seed(&self, user_id: &str, client_ids: &[&str]) {
        let mut entry = self.logins.entry(user_id.to_string()).or_default();
        for client_id in client_ids {
            entry.insert((*client_id).to_string());
        }
    }

    /// Make every call fail, to exercise redelivery paths
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn login_count(&self, user_id: &str) -> usize {
        self.logins.get(user_id).map(|set| set.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LoginStore for MemoryLoginStore {
    async fn store_login(&self, user_id: &str, client_id: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("injected store failure");
        }
        self.logins
            .entry(user_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }

    async fn fetch_client_ids(&self, user_id: &str) -> Result<Vec<String>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("injected store failure");
        }
        Ok(self
            .logins
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
