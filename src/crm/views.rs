//! Read-side filters over the snapshot arrays.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

use super::models::{Activity, Contact};

/// Case-insensitive substring search over name, company, email and location.
/// A blank query matches everything.
pub fn search_contacts<'a>(contacts: &'a [Contact], query: &str) -> Vec<&'a Contact> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return contacts.iter().collect();
    }
    contacts
        .iter()
        .filter(|c| {
            [
                Some(c.first_name.as_str()),
                Some(c.last_name.as_str()),
                c.display_company(),
                c.email.as_deref(),
                c.location.as_deref(),
            ]
            .into_iter()
            .flatten()
            .any(|field| field.to_lowercase().contains(&needle))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityFilter {
    #[default]
    All,
    Upcoming,
    Overdue,
    Completed,
}

impl ActivityFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Upcoming => "upcoming",
            Self::Overdue => "overdue",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for ActivityFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "upcoming" => Ok(Self::Upcoming),
            "overdue" => Ok(Self::Overdue),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid activity filter: {}", s)),
        }
    }
}

/// Calendar day of a stored due date. Accepts RFC 3339 timestamps and bare
/// `YYYY-MM-DD` dates.
fn due_day(raw: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

/// `All`, `Upcoming` and `Overdue` only show open activities. An unparseable
/// due date is treated like no due date.
pub fn filter_activities<'a>(
    activities: &'a [Activity],
    filter: ActivityFilter,
    today: NaiveDate,
) -> Vec<&'a Activity> {
    activities
        .iter()
        .filter(|a| {
            let due = || a.due_date.as_deref().and_then(due_day);
            match filter {
                ActivityFilter::Completed => a.completed,
                _ if a.completed => false,
                ActivityFilter::All => true,
                ActivityFilter::Overdue => due().is_some_and(|d| d < today),
                ActivityFilter::Upcoming => due().is_none_or(|d| d >= today),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::models::{ActivityType, Company};

    fn contact(first: &str, last: &str) -> Contact {
        Contact {
            id: format!("{}-{}", first, last),
            first_name: first.into(),
            last_name: last.into(),
            email: None,
            phone: None,
            job_title: None,
            company_id: None,
            company_name: None,
            location: None,
            main_need: None,
            budget_range: None,
            decision_authority: None,
            notes: None,
            owner_id: None,
            created_at: String::new(),
            updated_at: None,
            company: None,
            owner: None,
        }
    }

    fn activity(id: &str, due: Option<&str>, completed: bool) -> Activity {
        Activity {
            id: id.into(),
            activity_type: ActivityType::Task,
            description: id.into(),
            due_date: due.map(str::to_string),
            completed,
            completed_at: None,
            contact_id: None,
            deal_id: None,
            owner_id: None,
            created_at: String::new(),
            contact: None,
            deal: None,
            owner: None,
        }
    }

    fn ids<'a>(items: impl IntoIterator<Item = &'a Activity>) -> Vec<&'a str> {
        items.into_iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn test_search_contacts_fields() {
        let mut jane = contact("Jane", "Doe");
        jane.email = Some("jane@fleet.example".into());
        let mut rui = contact("Rui", "Alves");
        rui.company = Some(Company {
            id: "co1".into(),
            name: "Lisboa Logistics".into(),
            industry: None,
            size: None,
            website: None,
            created_at: String::new(),
            updated_at: None,
        });
        let mut mia = contact("Mia", "Costa");
        mia.company_name = Some("Porto Cargo".into());
        mia.location = Some("Braga".into());
        let contacts = vec![jane, rui, mia];

        let names = |q: &str| -> Vec<String> {
            search_contacts(&contacts, q)
                .into_iter()
                .map(Contact::full_name)
                .collect()
        };
        assert_eq!(names("DOE"), vec!["Jane Doe"]);
        assert_eq!(names("fleet.example"), vec!["Jane Doe"]);
        assert_eq!(names("lisboa"), vec!["Rui Alves"]);
        assert_eq!(names("cargo"), vec!["Mia Costa"]);
        assert_eq!(names("braga"), vec!["Mia Costa"]);
        assert_eq!(names("  ").len(), 3);
        assert!(names("nobody").is_empty());
    }

    #[test]
    fn test_activity_filters() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        let activities = vec![
            activity("past", Some("2024-06-14"), false),
            activity("today", Some("2024-06-15T09:00:00Z"), false),
            activity("future", Some("2024-07-01"), false),
            activity("undated", None, false),
            activity("done", Some("2024-06-01"), true),
        ];

        assert_eq!(
            ids(filter_activities(&activities, ActivityFilter::All, today)),
            vec!["past", "today", "future", "undated"]
        );
        assert_eq!(
            ids(filter_activities(&activities, ActivityFilter::Overdue, today)),
            vec!["past"]
        );
        assert_eq!(
            ids(filter_activities(&activities, ActivityFilter::Upcoming, today)),
            vec!["today", "future", "undated"]
        );
        assert_eq!(
            ids(filter_activities(&activities, ActivityFilter::Completed, today)),
            vec!["done"]
        );
    }

    #[test]
    fn test_due_day_formats() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        assert_eq!(due_day("2024-06-15"), Some(day));
        assert_eq!(due_day("2024-06-15T23:00:00+00:00"), Some(day));
        assert_eq!(due_day("2024-06-15 08:00:00"), Some(day));
        assert_eq!(due_day("soon"), None);
    }

    #[test]
    fn test_activity_filter_parse() {
        assert_eq!("overdue".parse::<ActivityFilter>().unwrap(), ActivityFilter::Overdue);
        assert!("later".parse::<ActivityFilter>().is_err());
    }
}
