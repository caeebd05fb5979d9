//! Refetch-on-write data sync.
//!
//! `CrmSync` owns the in-memory snapshot of the seven CRM collections. Every
//! `refresh_data()` re-reads all of them in parallel and swaps the snapshot
//! wholesale; nothing is ever patched in place. Each collection sits behind
//! its own `Arc`, so derived views can memoize on array identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::dto::{
    ActivityRow, CompanyRow, ContactRow, DealRow, InteractionRow, PlatformRow, StaffRow,
    decode_rows,
};
use super::models::*;
use super::schema::Table;
use super::store::{ChangeFeed, RecordStore, SelectQuery};
use super::ws::{WsMessage, broadcast_message};
use crate::errors::CrmError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub staff: Arc<Vec<Staff>>,
    pub contacts: Arc<Vec<Contact>>,
    pub companies: Arc<Vec<Company>>,
    pub deals: Arc<Vec<Deal>>,
    pub activities: Arc<Vec<Activity>>,
    pub interactions: Arc<Vec<Interaction>>,
    pub platforms: Arc<Vec<Platform>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct TableCounts {
    pub staff: usize,
    pub contacts: usize,
    pub companies: usize,
    pub deals: usize,
    pub activities: usize,
    pub interactions: usize,
    pub platforms: usize,
}

impl Snapshot {
    pub fn counts(&self) -> TableCounts {
        TableCounts {
            staff: self.staff.len(),
            contacts: self.contacts.len(),
            companies: self.companies.len(),
            deals: self.deals.len(),
            activities: self.activities.len(),
            interactions: self.interactions.len(),
            platforms: self.platforms.len(),
        }
    }

    pub fn deal(&self, id: &str) -> Option<&Deal> {
        self.deals.iter().find(|d| d.id == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub loading: bool,
    pub error: Option<String>,
    pub refresh_count: u64,
    pub last_refreshed: Option<String>,
    pub counts: TableCounts,
}

#[derive(Debug)]
struct SyncState {
    snapshot: Snapshot,
    loading: bool,
    error: Option<String>,
    last_refreshed: Option<String>,
    applied_generation: u64,
}

/// The seven snapshot queries, in refresh order.
pub fn snapshot_queries() -> [SelectQuery; 7] {
    [
        SelectQuery::all(Table::Staff),
        SelectQuery::all(Table::Contacts)
            .embed("company", Table::Companies, "company_id")
            .embed("owner", Table::Staff, "owner_id"),
        SelectQuery::all(Table::Companies),
        SelectQuery::all(Table::Deals)
            .embed("contact", Table::Contacts, "contact_id")
            .embed("company", Table::Companies, "company_id")
            .embed("platform", Table::Platforms, "platform_id")
            .embed("owner", Table::Staff, "owner_id"),
        SelectQuery::all(Table::Activities)
            .embed("contact", Table::Contacts, "contact_id")
            .embed("deal", Table::Deals, "deal_id")
            .embed("owner", Table::Staff, "owner_id")
            .order_by("due_date", true),
        SelectQuery::all(Table::Interactions).order_by("date", false),
        SelectQuery::all(Table::Platforms),
    ]
}

pub struct CrmSync {
    store: Arc<dyn RecordStore>,
    state: RwLock<SyncState>,
    refresh_count: AtomicU64,
    generation: AtomicU64,
    events: Option<broadcast::Sender<String>>,
}

impl CrmSync {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            state: RwLock::new(SyncState {
                snapshot: Snapshot::default(),
                loading: true,
                error: None,
                last_refreshed: None,
                applied_generation: 0,
            }),
            refresh_count: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            events: None,
        }
    }

    /// Publish refresh outcomes to WebSocket clients.
    pub fn with_events(mut self, tx: broadcast::Sender<String>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    fn read(&self) -> RwLockReadGuard<'_, SyncState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SyncState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Current snapshot. Cheap: clones seven `Arc`s.
    pub fn snapshot(&self) -> Snapshot {
        self.read().snapshot.clone()
    }

    pub fn loading(&self) -> bool {
        self.read().loading
    }

    pub fn error(&self) -> Option<String> {
        self.read().error.clone()
    }

    /// Number of refreshes started so far.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.read();
        SyncStatus {
            loading: state.loading,
            error: state.error.clone(),
            refresh_count: self.refresh_count(),
            last_refreshed: state.last_refreshed.clone(),
            counts: state.snapshot.counts(),
        }
    }

    /// Re-read all seven collections and replace the snapshot.
    ///
    /// Any failing query fails the whole refresh: the previous snapshot is
    /// kept and `error` is set. When refreshes overlap, the one started last
    /// wins.
    pub async fn refresh_data(&self) -> Result<(), CrmError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.write();
            state.loading = true;
            state.error = None;
        }

        let outcome = self.fetch_all().await;
        // Once a newer refresh has started it owns `loading` and `error`
        let latest = generation == self.generation.load(Ordering::SeqCst);

        match outcome {
            Ok(snapshot) => {
                let counts = snapshot.counts();
                let applied = {
                    let mut state = self.write();
                    let applied = generation >= state.applied_generation;
                    if applied {
                        state.snapshot = snapshot;
                        state.applied_generation = generation;
                        state.last_refreshed = Some(chrono::Utc::now().to_rfc3339());
                    }
                    if latest {
                        state.loading = false;
                    }
                    applied
                };
                if !applied {
                    tracing::debug!(generation, "dropped result of superseded refresh");
                    return Ok(());
                }
                tracing::info!(
                    staff = counts.staff,
                    contacts = counts.contacts,
                    companies = counts.companies,
                    deals = counts.deals,
                    activities = counts.activities,
                    interactions = counts.interactions,
                    platforms = counts.platforms,
                    "CRM data refreshed"
                );
                self.emit(&WsMessage::DataRefreshed {
                    counts,
                    refresh_count: self.refresh_count(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, latest, "CRM refresh failed");
                if latest {
                    let message = e.sync_message();
                    {
                        let mut state = self.write();
                        state.loading = false;
                        state.error = Some(message.clone());
                    }
                    self.emit(&WsMessage::RefreshFailed { error: message });
                }
                Err(e)
            }
        }
    }

    async fn fetch_all(&self) -> Result<Snapshot, CrmError> {
        let [staff_q, contacts_q, companies_q, deals_q, activities_q, interactions_q, platforms_q] =
            snapshot_queries();
        let store = &self.store;

        let (staff, contacts, companies, deals, activities, interactions, platforms) = tokio::try_join!(
            store.select(&staff_q),
            store.select(&contacts_q),
            store.select(&companies_q),
            store.select(&deals_q),
            store.select(&activities_q),
            store.select(&interactions_q),
            store.select(&platforms_q),
        )?;

        Ok(Snapshot {
            staff: Arc::new(decode_rows(Table::Staff, staff, StaffRow::into_staff)?),
            contacts: Arc::new(decode_rows(
                Table::Contacts,
                contacts,
                ContactRow::into_contact,
            )?),
            companies: Arc::new(decode_rows(
                Table::Companies,
                companies,
                CompanyRow::into_company,
            )?),
            deals: Arc::new(decode_rows(Table::Deals, deals, DealRow::into_deal)?),
            activities: Arc::new(decode_rows(
                Table::Activities,
                activities,
                ActivityRow::into_activity,
            )?),
            interactions: Arc::new(decode_rows(
                Table::Interactions,
                interactions,
                InteractionRow::into_interaction,
            )?),
            platforms: Arc::new(decode_rows(
                Table::Platforms,
                platforms,
                PlatformRow::into_platform,
            )?),
        })
    }

    fn emit(&self, msg: &WsMessage) {
        if let Some(tx) = &self.events {
            broadcast_message(tx, msg);
        }
    }

    /// Refresh whenever a watched table changes. Payloads are ignored.
    pub fn spawn_change_watcher(self: &Arc<Self>, feed: &ChangeFeed) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        let mut rx = feed.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.table.is_watched() => {
                        tracing::debug!(table = %event.table, kind = ?event.kind, "change notification");
                        // Coalesce a burst of notifications into one refresh
                        while rx.try_recv().is_ok() {}
                        // Failures are already recorded in the sync state
                        let _ = sync.refresh_data().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "change feed lagged, refreshing");
                        let _ = sync.refresh_data().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
