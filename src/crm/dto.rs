//! Wire shapes for store rows, and the mapping to domain types.
//!
//! Read DTOs mirror exactly what each select returns (including joined
//! sub-objects); `into_*` turns them into models, rejecting rows whose enum
//! columns hold values the CRM doesn't know. Write DTOs are what the entity
//! actions send.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::models::*;
use super::schema::Table;
use crate::errors::StoreError;

/// Accept a number, a numeric string (Postgres `numeric`), or null.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numeric {
        Number(f64),
        Text(String),
    }

    match Option::<Numeric>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Numeric::Number(n)) => Ok(Some(n)),
        Some(Numeric::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn decode_error(table: Table, message: impl Into<String>) -> StoreError {
    StoreError::Decode {
        table: table.name().to_string(),
        message: message.into(),
    }
}

/// Deserialize every row of a select into `R`, then map to the domain type.
pub fn decode_rows<R, T>(
    table: Table,
    rows: Vec<Value>,
    map: fn(R) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError>
where
    R: DeserializeOwned,
{
    rows.into_iter()
        .map(|row| {
            let row: R =
                serde_json::from_value(row).map_err(|e| decode_error(table, e.to_string()))?;
            map(row)
        })
        .collect()
}

// ── Read DTOs ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StaffRow {
    id: String,
    name: String,
    email: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    created_at: String,
}

impl StaffRow {
    pub fn into_staff(self) -> Result<Staff, StoreError> {
        let role = match self.role.as_deref() {
            None => UserRole::default(),
            Some(role) => role
                .parse()
                .map_err(|e: String| decode_error(Table::Staff, e))?,
        };
        Ok(Staff {
            id: self.id,
            name: self.name,
            email: self.email,
            role,
            avatar_url: self.avatar_url,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CompanyRow {
    id: String,
    name: String,
    #[serde(default)]
    industry: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: Option<String>,
}

impl CompanyRow {
    pub fn into_company(self) -> Result<Company, StoreError> {
        Ok(Company {
            id: self.id,
            name: self.name,
            industry: self.industry,
            size: self.size,
            website: self.website,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ContactRow {
    id: String,
    first_name: String,
    last_name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    job_title: Option<String>,
    #[serde(default)]
    company_id: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    main_need: Option<String>,
    #[serde(default)]
    budget_range: Option<String>,
    #[serde(default)]
    decision_authority: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    company: Option<CompanyRow>,
    #[serde(default)]
    owner: Option<StaffRow>,
}

impl ContactRow {
    pub fn into_contact(self) -> Result<Contact, StoreError> {
        Ok(Contact {
            id: self.id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            job_title: self.job_title,
            company_id: self.company_id,
            company_name: self.company_name,
            location: self.location,
            main_need: self.main_need,
            budget_range: self.budget_range,
            decision_authority: self.decision_authority,
            notes: self.notes,
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            company: self.company.map(CompanyRow::into_company).transpose()?,
            owner: self.owner.map(StaffRow::into_staff).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PlatformRow {
    id: String,
    name: String,
    #[serde(default)]
    created_at: String,
}

impl PlatformRow {
    pub fn into_platform(self) -> Result<Platform, StoreError> {
        Ok(Platform {
            id: self.id,
            name: self.name,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DealRow {
    id: String,
    title: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    value: Option<f64>,
    stage: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    probability: Option<f64>,
    #[serde(default)]
    expected_close_date: Option<String>,
    #[serde(default)]
    contact_id: Option<String>,
    #[serde(default)]
    company_id: Option<String>,
    #[serde(default)]
    platform_id: Option<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    contact: Option<ContactRow>,
    #[serde(default)]
    company: Option<CompanyRow>,
    #[serde(default)]
    platform: Option<PlatformRow>,
    #[serde(default)]
    owner: Option<StaffRow>,
}

impl DealRow {
    pub fn into_deal(self) -> Result<Deal, StoreError> {
        let stage = DealStage::from_wire(&self.stage).map_err(|e| decode_error(Table::Deals, e))?;
        let raw_probability = self.probability.unwrap_or(50.0);
        let probability = raw_probability.round().clamp(0.0, 100.0) as u8;
        if f64::from(probability) != raw_probability.round() {
            tracing::warn!(
                deal_id = %self.id,
                probability = raw_probability,
                "deal probability outside 0..=100, clamped"
            );
        }
        Ok(Deal {
            id: self.id,
            title: self.title,
            value: self.value.unwrap_or(0.0),
            stage,
            probability,
            expected_close_date: self.expected_close_date,
            contact_id: self.contact_id,
            company_id: self.company_id,
            platform_id: self.platform_id,
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            contact: self.contact.map(ContactRow::into_contact).transpose()?,
            company: self.company.map(CompanyRow::into_company).transpose()?,
            platform: self.platform.map(PlatformRow::into_platform).transpose()?,
            owner: self.owner.map(StaffRow::into_staff).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ActivityRow {
    id: String,
    #[serde(rename = "type")]
    activity_type: String,
    description: String,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    completed: Option<bool>,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    contact_id: Option<String>,
    #[serde(default)]
    deal_id: Option<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    contact: Option<ContactRow>,
    #[serde(default)]
    deal: Option<DealRow>,
    #[serde(default)]
    owner: Option<StaffRow>,
}

impl ActivityRow {
    pub fn into_activity(self) -> Result<Activity, StoreError> {
        let activity_type = self
            .activity_type
            .parse()
            .map_err(|e: String| decode_error(Table::Activities, e))?;
        Ok(Activity {
            id: self.id,
            activity_type,
            description: self.description,
            due_date: self.due_date,
            completed: self.completed.unwrap_or(false),
            completed_at: self.completed_at,
            contact_id: self.contact_id,
            deal_id: self.deal_id,
            owner_id: self.owner_id,
            created_at: self.created_at,
            contact: self.contact.map(ContactRow::into_contact).transpose()?,
            deal: self.deal.map(DealRow::into_deal).transpose()?,
            owner: self.owner.map(StaffRow::into_staff).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct InteractionRow {
    id: String,
    #[serde(rename = "type")]
    interaction_type: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    contact_id: Option<String>,
    #[serde(default)]
    deal_id: Option<String>,
    #[serde(default)]
    created_at: String,
}

impl InteractionRow {
    pub fn into_interaction(self) -> Result<Interaction, StoreError> {
        let interaction_type = self
            .interaction_type
            .parse()
            .map_err(|e: String| decode_error(Table::Interactions, e))?;
        Ok(Interaction {
            id: self.id,
            interaction_type,
            notes: self.notes,
            date: self.date.unwrap_or_else(|| self.created_at.clone()),
            contact_id: self.contact_id,
            deal_id: self.deal_id,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct IncidentRow {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reported_by: Option<String>,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default)]
    contact_id: Option<String>,
    #[serde(default)]
    platform_id: Option<String>,
    #[serde(default)]
    resolved_at: Option<String>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: Option<String>,
}

impl IncidentRow {
    pub fn into_incident(self) -> Result<Incident, StoreError> {
        let severity = match self.severity.as_deref() {
            None => IncidentSeverity::default(),
            Some(s) => s
                .parse()
                .map_err(|e: String| decode_error(Table::Incidents, e))?,
        };
        let status = match self.status.as_deref() {
            None => IncidentStatus::default(),
            Some(s) => s
                .parse()
                .map_err(|e: String| decode_error(Table::Incidents, e))?,
        };
        Ok(Incident {
            id: self.id,
            title: self.title,
            description: self.description,
            severity,
            status,
            reported_by: self.reported_by,
            assigned_to: self.assigned_to,
            contact_id: self.contact_id,
            platform_id: self.platform_id,
            resolved_at: self.resolved_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Write DTOs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewStaff {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaffPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCompany {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewContact {
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_need: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_authority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Patch fields where `null` clears the column and absence leaves it alone.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub company_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_need: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_authority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPlatform {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeal {
    pub title: String,
    pub value: f64,
    #[serde(default = "DealStage::first")]
    pub stage: DealStage,
    #[serde(default = "default_deal_probability")]
    pub probability: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_close_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Probability the pipeline form starts new deals at.
pub fn default_deal_probability() -> u8 {
    20
}

impl NewDeal {
    pub fn new(title: impl Into<String>, value: f64) -> Self {
        Self {
            title: title.into(),
            value,
            stage: DealStage::first(),
            probability: default_deal_probability(),
            expected_close_date: None,
            contact_id: None,
            company_id: None,
            platform_id: None,
            owner_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActivity {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInteraction {
    #[serde(rename = "type")]
    pub interaction_type: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub severity: IncidentSeverity,
    #[serde(default)]
    pub status: IncidentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    /// Stamped from `status` when the incident is reported.
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<IncidentSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<IncidentStatus>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub reported_by: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<Option<String>>,
    /// Derived from `status` on update; `Some(None)` clears the column.
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Option<String>>,
}

impl IncidentPatch {
    /// The JSON body sent to the store. Cleared columns are explicit nulls.
    pub fn to_row(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
