//! Incident log. Kept apart from the seven-table snapshot with its own
//! refresh, following the same refetch-on-write rule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;

use super::dto::{IncidentPatch, IncidentRow, NewIncident, decode_rows};
use super::models::{Incident, IncidentSeverity, IncidentStatus};
use super::schema::Table;
use super::store::{RecordStore, SelectQuery};
use super::ws::{WsMessage, broadcast_message};
use crate::errors::{CrmError, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub severity: Option<IncidentSeverity>,
    pub query: Option<String>,
}

fn parse_choice<T: std::str::FromStr<Err = String>>(raw: Option<&str>) -> Result<Option<T>, CrmError> {
    match raw.map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(CrmError::Validation),
    }
}

impl IncidentFilter {
    /// Build from query-string values; blank or `all` means no constraint.
    pub fn from_params(
        status: Option<&str>,
        severity: Option<&str>,
        query: Option<&str>,
    ) -> Result<Self, CrmError> {
        Ok(Self {
            status: parse_choice(status)?,
            severity: parse_choice(severity)?,
            query: query
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_lowercase),
        })
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        self.status.is_none_or(|s| incident.status == s)
            && self.severity.is_none_or(|s| incident.severity == s)
            && self.query.as_deref().is_none_or(|q| {
                incident.title.to_lowercase().contains(q)
                    || incident.description.to_lowercase().contains(q)
            })
    }

    pub fn apply<'a>(&self, incidents: &'a [Incident]) -> Vec<&'a Incident> {
        incidents.iter().filter(|i| self.matches(i)).collect()
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct IncidentLog {
    store: Arc<dyn RecordStore>,
    incidents: RwLock<Arc<Vec<Incident>>>,
    error: RwLock<Option<String>>,
    refresh_count: AtomicU64,
    events: Option<broadcast::Sender<String>>,
}

impl IncidentLog {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            incidents: RwLock::new(Arc::new(Vec::new())),
            error: RwLock::new(None),
            refresh_count: AtomicU64::new(0),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: broadcast::Sender<String>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Newest first.
    pub fn incidents(&self) -> Arc<Vec<Incident>> {
        self.incidents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    fn set_error(&self, error: Option<String>) {
        *self.error.write().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub async fn refresh(&self) -> Result<(), CrmError> {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        let query = SelectQuery::all(Table::Incidents).order_by("created_at", false);
        let result = match self.store.select(&query).await {
            Ok(rows) => decode_rows(Table::Incidents, rows, IncidentRow::into_incident)
                .map_err(CrmError::from),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(incidents) => {
                let count = incidents.len();
                *self.incidents.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(incidents);
                self.set_error(None);
                tracing::info!(incidents = count, "incident log refreshed");
                if let Some(tx) = &self.events {
                    broadcast_message(tx, &WsMessage::IncidentsRefreshed { count });
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "incident refresh failed");
                self.set_error(Some(e.sync_message()));
                Err(e)
            }
        }
    }

    async fn refetch(&self) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "refresh after incident write failed");
        }
    }

    fn decode(row: serde_json::Value) -> Result<Incident, CrmError> {
        decode_rows(Table::Incidents, vec![row], IncidentRow::into_incident)?
            .pop()
            .ok_or_else(|| CrmError::Other(anyhow::anyhow!("incidents write returned no row")))
    }

    pub async fn add(&self, mut incident: NewIncident) -> Result<Incident, CrmError> {
        if incident.title.trim().is_empty() || incident.description.trim().is_empty() {
            return Err(CrmError::Validation(
                "Title and description are required".into(),
            ));
        }
        incident.resolved_at = match incident.status {
            IncidentStatus::Resolved => Some(now()),
            IncidentStatus::Ongoing => None,
        };
        let row = serde_json::to_value(&incident).map_err(|e| CrmError::Other(e.into()))?;
        let created = self.store.insert(Table::Incidents, row).await?;
        tracing::info!(severity = incident.severity.as_str(), "incident reported");
        self.refetch().await;
        Self::decode(created)
    }

    /// `resolved_at` follows `status`: resolving keeps an existing stamp or
    /// sets one, reopening clears it.
    pub async fn update(&self, id: &str, mut patch: IncidentPatch) -> Result<Incident, CrmError> {
        match patch.status {
            Some(IncidentStatus::Resolved) => {
                let stamped = self.incidents().iter().any(|i| {
                    i.id == id && i.status == IncidentStatus::Resolved && i.resolved_at.is_some()
                });
                patch.resolved_at = if stamped { None } else { Some(Some(now())) };
            }
            Some(IncidentStatus::Ongoing) => patch.resolved_at = Some(None),
            None => patch.resolved_at = None,
        }
        let row = patch.to_row().map_err(|e| CrmError::Other(e.into()))?;
        let updated = self.store.update(Table::Incidents, id, row).await?;
        tracing::info!(incident_id = %id, "incident updated");
        self.refetch().await;
        Self::decode(updated)
    }

    /// Flip ongoing/resolved. Resolving stamps `resolved_at`; reopening clears it.
    pub async fn toggle_status(&self, id: &str) -> Result<Incident, CrmError> {
        let current = self
            .incidents()
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.status)
            .ok_or_else(|| StoreError::NotFound {
                table: Table::Incidents.name().to_string(),
                id: id.to_string(),
            })?;
        self.update(
            id,
            IncidentPatch {
                status: Some(current.toggled()),
                ..Default::default()
            },
        )
        .await
    }
}
