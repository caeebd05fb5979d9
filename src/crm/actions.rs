use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use super::dto::*;
use super::models::*;
use super::schema::Table;
use super::store::RecordStore;
use super::sync::{CrmSync, Snapshot};
use crate::errors::{CrmError, StoreError};

pub type Result<T> = std::result::Result<T, CrmError>;

const AVATAR_SERVICE: &str = "https://ui-avatars.com/api/";

/// Placeholder avatar for staff added without one.
pub fn default_avatar_url(name: &str) -> String {
    let encoded: String = name
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("+");
    format!("{}?name={}&background=random", AVATAR_SERVICE, encoded)
}

fn require(value: &str, message: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CrmError::Validation(message.to_string()));
    }
    Ok(())
}

fn to_row<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| CrmError::Other(e.into()))
}

fn decode_one<R, T>(
    table: Table,
    row: Value,
    map: fn(R) -> std::result::Result<T, StoreError>,
) -> Result<T>
where
    R: serde::de::DeserializeOwned,
{
    decode_rows(table, vec![row], map)?
        .pop()
        .ok_or_else(|| CrmError::Other(anyhow::anyhow!("{} write returned no row", table)))
}

/// Entity action API.
///
/// Every operation validates required fields, performs exactly one store
/// write, and on success runs one `refresh_data()` before returning. The
/// returned entity is the store's echo of the write; the snapshot is the
/// source of truth.
#[derive(Clone)]
pub struct Crm {
    store: Arc<dyn RecordStore>,
    sync: Arc<CrmSync>,
}

impl Crm {
    pub fn new(sync: Arc<CrmSync>) -> Self {
        Self {
            store: Arc::clone(sync.store()),
            sync,
        }
    }

    pub fn sync(&self) -> &Arc<CrmSync> {
        &self.sync
    }

    pub fn snapshot(&self) -> Snapshot {
        self.sync.snapshot()
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Shared refetch after a successful write. A failed refresh is recorded
    /// in the sync state and does not undo the write.
    async fn refetch(&self) {
        if let Err(e) = self.sync.refresh_data().await {
            tracing::warn!(error = %e, "refresh after write failed");
        }
    }

    async fn insert<R, T>(
        &self,
        table: Table,
        row: Value,
        map: fn(R) -> std::result::Result<T, StoreError>,
    ) -> Result<T>
    where
        R: serde::de::DeserializeOwned,
    {
        let stored = self.store.insert(table, row).await?;
        tracing::info!(table = %table, id = ?stored.get("id"), "record created");
        self.refetch().await;
        decode_one(table, stored, map)
    }

    async fn update<R, T>(
        &self,
        table: Table,
        id: &str,
        patch: Value,
        map: fn(R) -> std::result::Result<T, StoreError>,
    ) -> Result<T>
    where
        R: serde::de::DeserializeOwned,
    {
        let stored = self.store.update(table, id, patch).await?;
        tracing::info!(table = %table, id, "record updated");
        self.refetch().await;
        decode_one(table, stored, map)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        self.store.delete(table, id).await?;
        tracing::info!(table = %table, id, "record deleted");
        self.refetch().await;
        Ok(())
    }

    // ── Staff ──────────────────────────────────────────────────────────

    pub async fn add_staff(&self, mut staff: NewStaff) -> Result<Staff> {
        require(&staff.name, "Staff name is required")?;
        require(&staff.email, "Staff email is required")?;
        if staff.avatar_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
            staff.avatar_url = Some(default_avatar_url(&staff.name));
        }
        self.insert(Table::Staff, to_row(&staff)?, StaffRow::into_staff)
            .await
    }

    pub async fn update_staff(&self, id: &str, patch: StaffPatch) -> Result<Staff> {
        if let Some(name) = &patch.name {
            require(name, "Staff name is required")?;
        }
        if let Some(email) = &patch.email {
            require(email, "Staff email is required")?;
        }
        self.update(Table::Staff, id, to_row(&patch)?, StaffRow::into_staff)
            .await
    }

    pub async fn delete_staff(&self, id: &str) -> Result<()> {
        self.delete(Table::Staff, id).await
    }

    // ── Companies & contacts ───────────────────────────────────────────

    pub async fn add_company(&self, company: NewCompany) -> Result<Company> {
        require(&company.name, "Company name is required")?;
        self.insert(Table::Companies, to_row(&company)?, CompanyRow::into_company)
            .await
    }

    pub async fn add_contact(&self, contact: NewContact) -> Result<Contact> {
        require(&contact.first_name, "First name is required")?;
        require(&contact.last_name, "Last name is required")?;
        self.insert(Table::Contacts, to_row(&contact)?, ContactRow::into_contact)
            .await
    }

    pub async fn update_contact(&self, id: &str, patch: ContactPatch) -> Result<Contact> {
        if let Some(first) = &patch.first_name {
            require(first, "First name is required")?;
        }
        if let Some(last) = &patch.last_name {
            require(last, "Last name is required")?;
        }
        self.update(Table::Contacts, id, to_row(&patch)?, ContactRow::into_contact)
            .await
    }

    // ── Deals ──────────────────────────────────────────────────────────

    pub async fn add_deal(&self, deal: NewDeal) -> Result<Deal> {
        require(&deal.title, "Deal title is required")?;
        if !deal.value.is_finite() || deal.value < 0.0 {
            return Err(CrmError::Validation(
                "Deal value must be zero or more".into(),
            ));
        }
        if deal.probability > 100 {
            return Err(CrmError::Validation(
                "Probability must be between 0 and 100".into(),
            ));
        }
        self.insert(Table::Deals, to_row(&deal)?, DealRow::into_deal)
            .await
    }

    /// Persist a new stage with a single update call.
    pub async fn update_deal_stage(&self, id: &str, stage: DealStage) -> Result<Deal> {
        self.update(
            Table::Deals,
            id,
            json!({ "stage": stage.as_str() }),
            DealRow::into_deal,
        )
        .await
    }

    pub async fn delete_deal(&self, id: &str) -> Result<()> {
        self.delete(Table::Deals, id).await
    }

    // ── Activities & interactions ──────────────────────────────────────

    pub async fn add_activity(&self, activity: NewActivity) -> Result<Activity> {
        require(&activity.description, "Activity description is required")?;
        self.insert(
            Table::Activities,
            to_row(&activity)?,
            ActivityRow::into_activity,
        )
        .await
    }

    /// Mark an activity done (stamping `completed_at`) or reopen it.
    pub async fn complete_activity(&self, id: &str, completed: bool) -> Result<Activity> {
        let completed_at = completed.then(|| chrono::Utc::now().to_rfc3339());
        self.update(
            Table::Activities,
            id,
            json!({ "completed": completed, "completed_at": completed_at }),
            ActivityRow::into_activity,
        )
        .await
    }

    pub async fn add_interaction(&self, interaction: NewInteraction) -> Result<Interaction> {
        self.insert(
            Table::Interactions,
            to_row(&interaction)?,
            InteractionRow::into_interaction,
        )
        .await
    }

    // ── Platforms ──────────────────────────────────────────────────────

    pub async fn add_platform(&self, name: &str) -> Result<Platform> {
        require(name, "Platform name is required")?;
        let row = to_row(&NewPlatform {
            name: name.trim().to_string(),
        })?;
        self.insert(Table::Platforms, row, PlatformRow::into_platform)
            .await
    }

    pub async fn update_platform(&self, id: &str, name: &str) -> Result<Platform> {
        require(name, "Platform name is required")?;
        self.update(
            Table::Platforms,
            id,
            json!({ "name": name.trim() }),
            PlatformRow::into_platform,
        )
        .await
    }

    pub async fn delete_platform(&self, id: &str) -> Result<()> {
        self.delete(Table::Platforms, id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crm::store::testing::{RecordingStore, StoreOp};
    use crate::crm::store::{SelectQuery, SqliteStore};
    use crate::crm::sync::snapshot_queries;

    pub(crate) async fn crm_with_store() -> (Crm, Arc<RecordingStore>) {
        let store = RecordingStore::in_memory();
        let sync = Arc::new(CrmSync::new(store.clone()));
        sync.refresh_data().await.unwrap();
        store.clear();
        (Crm::new(sync), store)
    }

    /// A brand-new sync layer's view of the same store.
    async fn fresh_read(crm: &Crm) -> Snapshot {
        let sync = CrmSync::new(Arc::clone(crm.store()));
        sync.refresh_data().await.unwrap();
        sync.snapshot()
    }

    fn assert_one_write_then_refresh(store: &RecordingStore) {
        let ops = store.ops();
        assert!(ops[0].is_mutation(), "first op should be the write: {:?}", ops);
        assert_eq!(store.mutations().len(), 1, "ops: {:?}", ops);
        assert_eq!(ops.len(), 1 + snapshot_queries().len(), "ops: {:?}", ops);
    }

    #[test]
    fn test_default_avatar_url() {
        assert_eq!(
            default_avatar_url("Ana  Silva"),
            "https://ui-avatars.com/api/?name=Ana+Silva&background=random"
        );
    }

    #[tokio::test]
    async fn test_add_staff_writes_once_and_refreshes() {
        let (crm, store) = crm_with_store().await;
        let before = crm.sync().refresh_count();

        let staff = crm
            .add_staff(NewStaff {
                name: "Ana Silva".into(),
                email: "ana@wexlot.com".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(crm.sync().refresh_count(), before + 1);
        assert_one_write_then_refresh(&store);
        assert_eq!(staff.role, UserRole::Staff);
        assert!(staff.avatar_url.unwrap().contains("name=Ana+Silva"));
        assert_eq!(crm.snapshot().staff.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_touches_nothing() {
        let (crm, store) = crm_with_store().await;
        let err = crm
            .add_contact(NewContact {
                first_name: "Jane".into(),
                last_name: "  ".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)));
        assert!(store.ops().is_empty());

        let mut deal = NewDeal::new("Negative", -5.0);
        assert!(crm.add_deal(deal.clone()).await.is_err());
        deal.value = 5.0;
        deal.probability = 101;
        assert!(crm.add_deal(deal).await.is_err());
        assert!(crm.add_platform(" ").await.is_err());
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_write_does_not_refresh() {
        let (crm, store) = crm_with_store().await;
        store.fail_writes_on(Table::Deals);
        let before = crm.sync().refresh_count();

        let err = crm.add_deal(NewDeal::new("Fleet", 100.0)).await.unwrap_err();
        assert!(matches!(
            err.store_error(),
            Some(StoreError::RowLevelSecurity { .. })
        ));
        assert_eq!(crm.sync().refresh_count(), before);
        assert_eq!(store.ops().len(), 1);
    }

    #[tokio::test]
    async fn test_refetch_invariant_after_each_mutation() {
        let (crm, _store) = crm_with_store().await;

        let platform = crm.add_platform("Fleet").await.unwrap();
        assert_eq!(crm.snapshot().platforms, fresh_read(&crm).await.platforms);

        let contact = crm
            .add_contact(NewContact {
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut new_deal = NewDeal::new("Fleet rollout", 1000.0);
        new_deal.contact_id = Some(contact.id.clone());
        new_deal.platform_id = Some(platform.id.clone());
        let deal = crm.add_deal(new_deal).await.unwrap();

        crm.update_deal_stage(&deal.id, DealStage::Demo).await.unwrap();
        let activity = crm
            .add_activity(NewActivity {
                activity_type: ActivityType::Call,
                description: "Ring back".into(),
                due_date: None,
                contact_id: Some(contact.id.clone()),
                deal_id: Some(deal.id.clone()),
                owner_id: None,
            })
            .await
            .unwrap();
        crm.complete_activity(&activity.id, true).await.unwrap();

        let ours = crm.snapshot();
        let fresh = fresh_read(&crm).await;
        assert_eq!(ours.deals, fresh.deals);
        assert_eq!(ours.activities, fresh.activities);
        assert_eq!(ours.contacts, fresh.contacts);
        assert_eq!(ours.deals[0].stage, DealStage::Demo);
        assert_eq!(ours.deals[0].platform.as_ref().unwrap().name, "Fleet");
        assert!(ours.activities[0].completed);
        assert!(ours.activities[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_deal_stage_is_single_update() {
        let (crm, store) = crm_with_store().await;
        let deal = crm.add_deal(NewDeal::new("Fleet", 10.0)).await.unwrap();
        store.clear();

        crm.update_deal_stage(&deal.id, DealStage::Decision)
            .await
            .unwrap();
        assert_eq!(
            store.mutations(),
            vec![StoreOp::Update(
                Table::Deals,
                deal.id.clone(),
                json!({"stage": "decision"})
            )]
        );
        assert_one_write_then_refresh(&store);
    }

    #[tokio::test]
    async fn test_complete_activity_toggles_completed_at() {
        let (crm, _) = crm_with_store().await;
        let activity = crm
            .add_activity(NewActivity {
                activity_type: ActivityType::Task,
                description: "Send quote".into(),
                due_date: Some("2024-06-01".into()),
                contact_id: None,
                deal_id: None,
                owner_id: None,
            })
            .await
            .unwrap();

        let done = crm.complete_activity(&activity.id, true).await.unwrap();
        assert!(done.completed && done.completed_at.is_some());

        let reopened = crm.complete_activity(&activity.id, false).await.unwrap();
        assert!(!reopened.completed);
        assert!(reopened.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_platform_lifecycle_and_duplicate_name() {
        let (crm, _) = crm_with_store().await;
        let platform = crm.add_platform("Fleet").await.unwrap();
        let err = crm.add_platform("Fleet").await.unwrap_err();
        assert!(matches!(err.store_error(), Some(StoreError::Conflict { .. })));

        let renamed = crm.update_platform(&platform.id, "Fleet Pro").await.unwrap();
        assert_eq!(renamed.name, "Fleet Pro");
        crm.delete_platform(&platform.id).await.unwrap();
        assert!(crm.snapshot().platforms.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_contact_is_not_found() {
        let (crm, _) = crm_with_store().await;
        let err = crm
            .update_contact(
                "missing",
                ContactPatch {
                    phone: Some("555".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err.store_error(), Some(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_contact_can_unlink_company_and_owner() {
        let (crm, store) = crm_with_store().await;
        let company = crm
            .add_company(NewCompany {
                name: "Acme".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let owner = crm
            .add_staff(NewStaff {
                name: "Ana".into(),
                email: "ana@wexlot.com".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let contact = crm
            .add_contact(NewContact {
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                company_id: Some(company.id.clone()),
                owner_id: Some(owner.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(contact.company_id.as_deref(), Some(company.id.as_str()));

        store.clear();
        let updated = crm
            .update_contact(
                &contact.id,
                ContactPatch {
                    company_id: Some(None),
                    owner_id: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.company_id.is_none());
        assert!(updated.owner_id.is_none());
        assert_eq!(
            store.mutations(),
            vec![StoreOp::Update(
                Table::Contacts,
                contact.id.clone(),
                serde_json::json!({"company_id": null, "owner_id": null})
            )]
        );
        let cached = crm.snapshot();
        assert!(cached.contacts[0].company.is_none());
    }

    #[tokio::test]
    async fn test_staff_update_and_delete() {
        let (crm, _) = crm_with_store().await;
        let staff = crm
            .add_staff(NewStaff {
                name: "Ana".into(),
                email: "ana@wexlot.com".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let updated = crm
            .update_staff(
                &staff.id,
                StaffPatch {
                    role: Some(UserRole::Admin),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.role, UserRole::Admin);
        crm.delete_staff(&staff.id).await.unwrap();
        assert!(crm.snapshot().staff.is_empty());
    }

    #[tokio::test]
    async fn test_interaction_defaults_date() {
        let (crm, _) = crm_with_store().await;
        crm.add_company(NewCompany {
            name: "Acme".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let interaction = crm
            .add_interaction(NewInteraction {
                interaction_type: ActivityType::Meeting,
                notes: Some("Met at depot".into()),
                date: None,
                contact_id: None,
                deal_id: None,
            })
            .await
            .unwrap();
        assert!(!interaction.date.is_empty());
        assert_eq!(crm.snapshot().interactions.len(), 1);
        assert_eq!(crm.snapshot().companies.len(), 1);
    }

    #[tokio::test]
    async fn test_works_against_plain_sqlite_store() {
        let store: Arc<dyn RecordStore> = Arc::new(
            SqliteStore::new_in_memory(crate::crm::store::ChangeFeed::default()).unwrap(),
        );
        let crm = Crm::new(Arc::new(CrmSync::new(store.clone())));
        crm.add_platform("Fleet").await.unwrap();
        let rows = store
            .select(&SelectQuery::all(Table::Platforms))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
