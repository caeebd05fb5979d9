use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::models::{Activity, Deal, Interaction, Staff};
use super::sync::Snapshot;

pub const RECENT_INTERACTIONS: usize = 5;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RepStats {
    pub staff_id: String,
    pub name: String,
    pub pipeline_value: f64,
    /// Completed activities owned by this rep.
    pub activity_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DashboardStats {
    pub total_pipeline_value: f64,
    pub weighted_forecast: f64,
    pub active_deals: usize,
    pub by_rep: Vec<RepStats>,
    pub recent_interactions: Vec<Interaction>,
}

pub fn total_pipeline_value(deals: &[Deal]) -> f64 {
    deals.iter().map(|d| d.value).sum()
}

pub fn weighted_forecast(deals: &[Deal]) -> f64 {
    deals.iter().map(Deal::weighted_value).sum()
}

pub fn active_deal_count(deals: &[Deal]) -> usize {
    deals.iter().filter(|d| d.is_active()).count()
}

pub fn rep_stats(staff: &[Staff], deals: &[Deal], activities: &[Activity]) -> Vec<RepStats> {
    staff
        .iter()
        .map(|member| {
            let owned = |owner: &Option<String>| owner.as_deref() == Some(member.id.as_str());
            RepStats {
                staff_id: member.id.clone(),
                name: member.name.clone(),
                pipeline_value: deals
                    .iter()
                    .filter(|d| owned(&d.owner_id))
                    .map(|d| d.value)
                    .sum(),
                activity_count: activities
                    .iter()
                    .filter(|a| a.completed && owned(&a.owner_id))
                    .count(),
            }
        })
        .collect()
}

/// Interactions arrive newest first, so the head of the array is the recent set.
pub fn recent_interactions(interactions: &[Interaction]) -> Vec<Interaction> {
    interactions.iter().take(RECENT_INTERACTIONS).cloned().collect()
}

pub fn compute(
    deals: &[Deal],
    activities: &[Activity],
    staff: &[Staff],
    interactions: &[Interaction],
) -> DashboardStats {
    DashboardStats {
        total_pipeline_value: total_pipeline_value(deals),
        weighted_forecast: weighted_forecast(deals),
        active_deals: active_deal_count(deals),
        by_rep: rep_stats(staff, deals, activities),
        recent_interactions: recent_interactions(interactions),
    }
}

struct MemoKey {
    deals: Arc<Vec<Deal>>,
    activities: Arc<Vec<Activity>>,
    staff: Arc<Vec<Staff>>,
    interactions: Arc<Vec<Interaction>>,
}

impl MemoKey {
    fn of(snapshot: &Snapshot) -> Self {
        Self {
            deals: Arc::clone(&snapshot.deals),
            activities: Arc::clone(&snapshot.activities),
            staff: Arc::clone(&snapshot.staff),
            interactions: Arc::clone(&snapshot.interactions),
        }
    }

    fn matches(&self, snapshot: &Snapshot) -> bool {
        Arc::ptr_eq(&self.deals, &snapshot.deals)
            && Arc::ptr_eq(&self.activities, &snapshot.activities)
            && Arc::ptr_eq(&self.staff, &snapshot.staff)
            && Arc::ptr_eq(&self.interactions, &snapshot.interactions)
    }
}

/// Recomputes only when one of the four source arrays was replaced.
#[derive(Default)]
pub struct DashboardMemo {
    cache: Mutex<Option<(MemoKey, Arc<DashboardStats>)>>,
}

impl DashboardMemo {
    pub fn get(&self, snapshot: &Snapshot) -> Arc<DashboardStats> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((key, stats)) = cache.as_ref()
            && key.matches(snapshot)
        {
            return Arc::clone(stats);
        }
        let stats = Arc::new(compute(
            &snapshot.deals,
            &snapshot.activities,
            &snapshot.staff,
            &snapshot.interactions,
        ));
        *cache = Some((MemoKey::of(snapshot), Arc::clone(&stats)));
        stats
    }
}
