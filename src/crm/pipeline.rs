//! Pipeline board: stage columns grouped by platform, then contact.
//!
//! The board is a pure function of the deal array. Drag-and-drop is a small
//! state machine whose only side effect is a single `update_deal_stage`;
//! the board itself is re-derived from the next snapshot.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::actions::Crm;
use super::models::{Deal, DealStage};
use crate::errors::CrmError;

pub const NO_PLATFORM: &str = "No platform";
pub const NO_CONTACT: &str = "No contact";

#[derive(Debug, Clone, Serialize)]
pub struct ContactGroup {
    pub contact_id: Option<String>,
    pub contact_name: String,
    pub platform_name: String,
    pub total_value: f64,
    pub deals: Vec<Deal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformGroup {
    pub platform_id: Option<String>,
    pub platform_name: String,
    pub total_value: f64,
    pub contacts: Vec<ContactGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageColumn {
    pub stage: DealStage,
    pub label: &'static str,
    pub deal_count: usize,
    pub total_value: f64,
    pub groups: Vec<PlatformGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardView {
    pub columns: Vec<StageColumn>,
    pub total_value: f64,
}

impl BoardView {
    pub fn column(&self, stage: DealStage) -> Option<&StageColumn> {
        self.columns.iter().find(|c| c.stage == stage)
    }

    /// Every deal id on the board, column by column.
    pub fn deal_ids(&self) -> Vec<&str> {
        self.columns
            .iter()
            .flat_map(|c| &c.groups)
            .flat_map(|g| &g.contacts)
            .flat_map(|c| &c.deals)
            .map(|d| d.id.as_str())
            .collect()
    }
}

fn platform_name(deal: &Deal) -> String {
    match (&deal.platform, &deal.platform_id) {
        (Some(platform), _) => platform.name.clone(),
        (None, Some(_)) => "Unknown platform".to_string(),
        (None, None) => NO_PLATFORM.to_string(),
    }
}

fn contact_name(deal: &Deal) -> String {
    match (&deal.contact, &deal.contact_id) {
        (Some(contact), _) => contact.full_name(),
        (None, Some(_)) => "Unknown contact".to_string(),
        (None, None) => NO_CONTACT.to_string(),
    }
}

/// Group deals into one column per stage (enum order), then by platform,
/// then by contact. Groups keep the order their first deal appears in.
pub fn group_deals(deals: &[Deal]) -> BoardView {
    let mut columns: Vec<StageColumn> = DealStage::ALL
        .iter()
        .map(|&stage| StageColumn {
            stage,
            label: stage.label(),
            deal_count: 0,
            total_value: 0.0,
            groups: Vec::new(),
        })
        .collect();

    for deal in deals {
        // ALL covers every variant, so the column always exists
        let Some(column) = columns.iter_mut().find(|c| c.stage == deal.stage) else {
            continue;
        };
        column.deal_count += 1;
        column.total_value += deal.value;

        let group = match column
            .groups
            .iter()
            .position(|g| g.platform_id == deal.platform_id)
        {
            Some(idx) => &mut column.groups[idx],
            None => {
                column.groups.push(PlatformGroup {
                    platform_id: deal.platform_id.clone(),
                    platform_name: platform_name(deal),
                    total_value: 0.0,
                    contacts: Vec::new(),
                });
                let last = column.groups.len() - 1;
                &mut column.groups[last]
            }
        };
        group.total_value += deal.value;

        let leaf = match group
            .contacts
            .iter()
            .position(|c| c.contact_id == deal.contact_id)
        {
            Some(idx) => &mut group.contacts[idx],
            None => {
                group.contacts.push(ContactGroup {
                    contact_id: deal.contact_id.clone(),
                    contact_name: contact_name(deal),
                    platform_name: group.platform_name.clone(),
                    total_value: 0.0,
                    deals: Vec::new(),
                });
                let last = group.contacts.len() - 1;
                &mut group.contacts[last]
            }
        };
        leaf.total_value += deal.value;
        leaf.deals.push(deal.clone());
    }

    let total_value = columns.iter().map(|c| c.total_value).sum();
    BoardView {
        columns,
        total_value,
    }
}

/// Single-level memo keyed on the identity of the deals array.
#[derive(Default)]
pub struct BoardMemo {
    cache: Mutex<Option<(Arc<Vec<Deal>>, Arc<BoardView>)>>,
}

impl BoardMemo {
    pub fn get(&self, deals: &Arc<Vec<Deal>>) -> Arc<BoardView> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((key, view)) = cache.as_ref()
            && Arc::ptr_eq(key, deals)
        {
            return Arc::clone(view);
        }
        let view = Arc::new(group_deals(deals));
        *cache = Some((Arc::clone(deals), Arc::clone(&view)));
        view
    }
}

// ── Drag and drop ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DragState {
    #[default]
    Idle,
    Dragging { deal_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMove {
    pub deal_id: String,
    pub stage: DealStage,
}

impl DragState {
    pub fn start(&mut self, deal_id: impl Into<String>) {
        *self = DragState::Dragging {
            deal_id: deal_id.into(),
        };
    }

    /// Whether a drop on `stage` would be accepted right now.
    pub fn drag_over(&self, _stage: DealStage) -> bool {
        matches!(self, DragState::Dragging { .. })
    }

    pub fn cancel(&mut self) {
        *self = DragState::Idle;
    }

    /// Finish the drag, yielding the one stage update to issue.
    pub fn drop_on(&mut self, stage: DealStage) -> Result<StageMove, CrmError> {
        match std::mem::take(self) {
            DragState::Dragging { deal_id } => Ok(StageMove { deal_id, stage }),
            DragState::Idle => Err(CrmError::NoDragInProgress),
        }
    }
}

/// Drop the dragged deal on `stage`: exactly one stage update, then Idle.
pub async fn drop_deal(crm: &Crm, drag: &mut DragState, stage: DealStage) -> Result<Deal, CrmError> {
    let StageMove { deal_id, stage } = drag.drop_on(stage)?;
    tracing::debug!(deal_id = %deal_id, stage = %stage, "deal dropped");
    crm.update_deal_stage(&deal_id, stage).await
}

// ── Card menu ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "stage", rename_all = "snake_case")]
pub enum CardAction {
    MoveToNext,
    MoveTo(DealStage),
    MarkWon,
    MarkLost,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardMenuItem {
    #[serde(flatten)]
    pub action: CardAction,
    pub label: String,
}

impl CardAction {
    pub fn label(&self, deal: &Deal) -> String {
        match self {
            CardAction::MoveToNext => match deal.stage.next() {
                Some(next) => format!("Move to {}", next.label()),
                None => "Move to next stage".to_string(),
            },
            CardAction::MoveTo(stage) => format!("Move to {}", stage.label()),
            CardAction::MarkWon => "Mark as won".to_string(),
            CardAction::MarkLost => "Mark as lost".to_string(),
            CardAction::Delete => "Delete deal".to_string(),
        }
    }
}

/// Menu for one deal card.
pub fn card_actions(deal: &Deal) -> Vec<CardAction> {
    let mut actions = Vec::new();
    if !deal.stage.is_terminal() && deal.stage.next().is_some() {
        actions.push(CardAction::MoveToNext);
    }
    actions.extend(
        DealStage::ALL
            .iter()
            .filter(|s| !s.is_terminal() && **s != deal.stage)
            .map(|&s| CardAction::MoveTo(s)),
    );
    if deal.stage != DealStage::ClosedWon {
        actions.push(CardAction::MarkWon);
    }
    if deal.stage != DealStage::ClosedLost {
        actions.push(CardAction::MarkLost);
    }
    actions.push(CardAction::Delete);
    actions
}

pub fn card_menu(deal: &Deal) -> Vec<CardMenuItem> {
    card_actions(deal)
        .into_iter()
        .map(|action| CardMenuItem {
            label: action.label(deal),
            action,
        })
        .collect()
}

/// Run a card action. Returns the updated deal, or `None` after a delete.
pub async fn apply_card_action(
    crm: &Crm,
    deal: &Deal,
    action: CardAction,
) -> Result<Option<Deal>, CrmError> {
    let target = match action {
        CardAction::MoveToNext => deal.stage.next().ok_or_else(|| {
            CrmError::Validation(format!("{} has no next stage", deal.stage.label()))
        })?,
        CardAction::MoveTo(stage) if stage == deal.stage => {
            return Err(CrmError::StageUnchanged {
                deal_id: deal.id.clone(),
                stage: stage.to_string(),
            });
        }
        CardAction::MoveTo(stage) => stage,
        CardAction::MarkWon => DealStage::ClosedWon,
        CardAction::MarkLost => DealStage::ClosedLost,
        CardAction::Delete => {
            crm.delete_deal(&deal.id).await?;
            return Ok(None);
        }
    };
    crm.update_deal_stage(&deal.id, target).await.map(Some)
}
