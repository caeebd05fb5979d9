//! Quick lead capture: one contact, plus an opening deal when a platform is picked.

use serde::{Deserialize, Serialize};

use super::actions::Crm;
use super::dto::{NewContact, NewDeal};
use super::models::{Contact, Deal, DealStage, Staff};
use crate::errors::CrmError;

pub const QUICK_DEAL_PROBABILITY: u8 = 10;
const MISSING_LAST_NAME: &str = "-";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuickLead {
    /// Staff member taking the lead, matched by full or first name.
    #[serde(default)]
    pub username: String,
    pub client_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub platform_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuickAddOutcome {
    pub contact: Contact,
    pub deal: Option<Deal>,
}

/// Case-insensitive match on full name, then on first name.
pub fn resolve_owner<'a>(staff: &'a [Staff], username: &str) -> Option<&'a Staff> {
    let wanted = username.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    staff
        .iter()
        .find(|s| s.name.to_lowercase() == wanted)
        .or_else(|| staff.iter().find(|s| s.first_name().to_lowercase() == wanted))
}

/// First token is the first name; the rest is the last name.
pub fn split_name(client_name: &str) -> (String, String) {
    let mut parts = client_name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    let last = if rest.is_empty() {
        MISSING_LAST_NAME.to_string()
    } else {
        rest
    };
    (first, last)
}

pub fn lead_notes(location: Option<&str>, notes: Option<&str>) -> String {
    format!(
        "Location: {}\n\nNotes: {}",
        location.unwrap_or_default().trim(),
        notes.unwrap_or_default().trim()
    )
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Insert the contact, then the deal if a platform was chosen. The two
/// writes are independent: a failed deal leaves the contact in place.
pub async fn quick_add_lead(crm: &Crm, lead: QuickLead) -> Result<QuickAddOutcome, CrmError> {
    if lead.client_name.trim().is_empty() {
        return Err(CrmError::Validation("Client name is required".into()));
    }
    let (first_name, last_name) = split_name(&lead.client_name);
    let owner_id = resolve_owner(&crm.snapshot().staff, &lead.username).map(|s| s.id.clone());
    if owner_id.is_none() && !lead.username.trim().is_empty() {
        tracing::debug!(username = %lead.username, "no staff member matches lead owner");
    }

    let location = non_blank(&lead.location);
    let contact = crm
        .add_contact(NewContact {
            first_name: first_name.clone(),
            last_name: last_name.clone(),
            phone: non_blank(&lead.phone),
            notes: Some(lead_notes(location.as_deref(), lead.notes.as_deref())),
            location,
            owner_id: owner_id.clone(),
            ..Default::default()
        })
        .await?;

    let Some(platform_id) = non_blank(&lead.platform_id) else {
        return Ok(QuickAddOutcome {
            contact,
            deal: None,
        });
    };

    let mut deal = NewDeal::new(format!("{} {} - New Deal", first_name, last_name), 0.0);
    deal.stage = DealStage::first();
    deal.probability = QUICK_DEAL_PROBABILITY;
    deal.contact_id = Some(contact.id.clone());
    deal.platform_id = Some(platform_id);
    deal.owner_id = owner_id;

    match crm.add_deal(deal).await {
        Ok(deal) => Ok(QuickAddOutcome {
            contact,
            deal: Some(deal),
        }),
        Err(source) => {
            tracing::warn!(contact_id = %contact.id, error = %source, "lead deal insert failed");
            Err(CrmError::LeadDealFailed {
                contact_id: contact.id,
                source: Box::new(source),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crm::actions::tests::crm_with_store;
    use crate::crm::dto::NewStaff;
    use crate::crm::schema::Table;
    use crate::crm::store::testing::StoreOp;
    use crate::errors::StoreError;

    fn lead(name: &str, platform: Option<&str>) -> QuickLead {
        QuickLead {
            username: String::new(),
            client_name: name.into(),
            phone: Some("555-1234".into()),
            location: Some("Lisbon".into()),
            platform_id: platform.map(str::to_string),
            notes: Some("Wants a demo".into()),
        }
    }

    fn inserts(store: &[StoreOp]) -> Vec<(Table, serde_json::Value)> {
        store
            .iter()
            .filter_map(|op| match op {
                StoreOp::Insert(table, row) => Some((*table, row.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("Jane Doe"), ("Jane".into(), "Doe".into()));
        assert_eq!(split_name("  Maria da Silva "), ("Maria".into(), "da Silva".into()));
        assert_eq!(split_name("Cher"), ("Cher".into(), "-".into()));
    }

    #[test]
    fn test_lead_notes_format() {
        assert_eq!(
            lead_notes(Some("Porto"), Some("Call back")),
            "Location: Porto\n\nNotes: Call back"
        );
        assert_eq!(lead_notes(None, None), "Location: \n\nNotes: ");
    }

    #[tokio::test]
    async fn test_contact_then_deal_with_platform() {
        let (crm, store) = crm_with_store().await;
        let platform = crm.add_platform("P1").await.unwrap();
        store.clear();

        let outcome = quick_add_lead(&crm, lead("Jane Doe", Some(&platform.id)))
            .await
            .unwrap();

        let writes = inserts(&store.mutations());
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, Table::Contacts);
        assert_eq!(writes[0].1["first_name"], "Jane");
        assert_eq!(writes[0].1["last_name"], "Doe");
        assert_eq!(writes[0].1["phone"], "555-1234");
        assert_eq!(writes[1].0, Table::Deals);
        assert_eq!(writes[1].1["contact_id"], json!(outcome.contact.id));
        assert_eq!(writes[1].1["platform_id"], json!(platform.id));
        assert_eq!(writes[1].1["title"], "Jane Doe - New Deal");
        assert_eq!(writes[1].1["probability"], 10);
        assert_eq!(writes[1].1["stage"], "planned-visit");

        let deal = outcome.deal.unwrap();
        assert_eq!(deal.value, 0.0);
        assert_eq!(crm.snapshot().deals.len(), 1);
        assert_eq!(
            crm.snapshot().contacts[0].notes.as_deref(),
            Some("Location: Lisbon\n\nNotes: Wants a demo")
        );
    }

    #[tokio::test]
    async fn test_no_platform_means_no_deal() {
        let (crm, store) = crm_with_store().await;
        let outcome = quick_add_lead(&crm, lead("Jane Doe", None)).await.unwrap();
        assert!(outcome.deal.is_none());
        let writes = inserts(&store.mutations());
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, Table::Contacts);
    }

    #[tokio::test]
    async fn test_failed_contact_insert_skips_deal() {
        let (crm, store) = crm_with_store().await;
        store.fail_writes_on(Table::Contacts);
        let err = quick_add_lead(&crm, lead("Jane Doe", Some("p1")))
            .await
            .unwrap_err();
        assert!(matches!(
            err.store_error(),
            Some(StoreError::RowLevelSecurity { .. })
        ));
        assert!(store.mutations().iter().all(|op| !matches!(op, StoreOp::Insert(Table::Deals, _))));
    }

    #[tokio::test]
    async fn test_failed_deal_keeps_contact() {
        let (crm, store) = crm_with_store().await;
        store.fail_writes_on(Table::Deals);
        let err = quick_add_lead(&crm, lead("Jane Doe", Some("p1")))
            .await
            .unwrap_err();
        let CrmError::LeadDealFailed { contact_id, .. } = &err else {
            panic!("expected LeadDealFailed, got {:?}", err);
        };
        let snapshot = crm.snapshot();
        assert_eq!(snapshot.contacts.len(), 1);
        assert_eq!(&snapshot.contacts[0].id, contact_id);
        assert!(snapshot.deals.is_empty());
    }

    #[tokio::test]
    async fn test_owner_resolution() {
        let (crm, _store) = crm_with_store().await;
        let ana = crm
            .add_staff(NewStaff {
                name: "Ana Silva".into(),
                email: "ana@wexlot.test".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let staff = crm.snapshot().staff;
        assert_eq!(resolve_owner(&staff, "ANA SILVA").map(|s| &s.id), Some(&ana.id));
        assert_eq!(resolve_owner(&staff, "ana").map(|s| &s.id), Some(&ana.id));
        assert!(resolve_owner(&staff, "silva").is_none());
        assert!(resolve_owner(&staff, "").is_none());

        let mut with_owner = lead("Jane Doe", None);
        with_owner.username = "Ana".into();
        let outcome = quick_add_lead(&crm, with_owner).await.unwrap();
        assert_eq!(outcome.contact.owner_id.as_deref(), Some(ana.id.as_str()));
    }

    #[tokio::test]
    async fn test_blank_client_name_rejected() {
        let (crm, store) = crm_with_store().await;
        let err = quick_add_lead(&crm, lead("   ", None)).await.unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)));
        assert!(store.ops().is_empty());
    }
}
