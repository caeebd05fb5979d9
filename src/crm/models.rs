use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    #[default]
    Staff,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "staff" => Ok(Self::Staff),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Staff {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

impl Staff {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub industry: Option<String>,
    pub size: Option<String>,
    pub website: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub job_title: Option<String>,
    pub company_id: Option<String>,
    /// Free-text business name, used when no company row is linked.
    pub company_name: Option<String>,
    pub location: Option<String>,
    pub main_need: Option<String>,
    pub budget_range: Option<String>,
    pub decision_authority: Option<String>,
    pub notes: Option<String>,
    pub owner_id: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<Company>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Staff>,
}

impl Contact {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// The joined company's name, falling back to the free-text field.
    pub fn display_company(&self) -> Option<&str> {
        self.company
            .as_ref()
            .map(|c| c.name.as_str())
            .or(self.company_name.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Platform {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

/// Pipeline stage. Variant order is the board's column order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum DealStage {
    PlannedVisit,
    FirstContact,
    DecisionMaker,
    Demo,
    Decision,
    ClosedWon,
    ClosedLost,
}

impl DealStage {
    pub const ALL: [DealStage; 7] = [
        Self::PlannedVisit,
        Self::FirstContact,
        Self::DecisionMaker,
        Self::Demo,
        Self::Decision,
        Self::ClosedWon,
        Self::ClosedLost,
    ];

    /// Stage new deals start in.
    pub fn first() -> Self {
        Self::PlannedVisit
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlannedVisit => "planned-visit",
            Self::FirstContact => "first-contact",
            Self::DecisionMaker => "decision-maker",
            Self::Demo => "demo",
            Self::Decision => "decision",
            Self::ClosedWon => "closed-won",
            Self::ClosedLost => "closed-lost",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::PlannedVisit => "Planned Visit",
            Self::FirstContact => "First Contact",
            Self::DecisionMaker => "Decision Maker",
            Self::Demo => "Demo",
            Self::Decision => "Decision",
            Self::ClosedWon => "Won",
            Self::ClosedLost => "Lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ClosedWon | Self::ClosedLost)
    }

    /// Successor on the happy path. `closed-lost` is never a successor.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::PlannedVisit => Some(Self::FirstContact),
            Self::FirstContact => Some(Self::DecisionMaker),
            Self::DecisionMaker => Some(Self::Demo),
            Self::Demo => Some(Self::Decision),
            Self::Decision => Some(Self::ClosedWon),
            Self::ClosedWon | Self::ClosedLost => None,
        }
    }

    /// Parse a stage as stored, accepting the older pipeline's stage names.
    pub fn from_wire(s: &str) -> Result<Self, String> {
        match s {
            "lead" => Ok(Self::PlannedVisit),
            "contacted" => Ok(Self::FirstContact),
            "meeting" => Ok(Self::DecisionMaker),
            "proposal" => Ok(Self::Demo),
            "negotiation" => Ok(Self::Decision),
            other => Self::from_str(other),
        }
    }
}

impl std::fmt::Display for DealStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned-visit" => Ok(Self::PlannedVisit),
            "first-contact" => Ok(Self::FirstContact),
            "decision-maker" => Ok(Self::DecisionMaker),
            "demo" => Ok(Self::Demo),
            "decision" => Ok(Self::Decision),
            "closed-won" => Ok(Self::ClosedWon),
            "closed-lost" => Ok(Self::ClosedLost),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deal {
    pub id: String,
    pub title: String,
    pub value: f64,
    pub stage: DealStage,
    pub probability: u8,
    pub expected_close_date: Option<String>,
    pub contact_id: Option<String>,
    pub company_id: Option<String>,
    pub platform_id: Option<String>,
    pub owner_id: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<Company>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Staff>,
}

impl Deal {
    pub fn is_active(&self) -> bool {
        !self.stage.is_terminal()
    }

    pub fn weighted_value(&self) -> f64 {
        self.value * f64::from(self.probability) / 100.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Call,
    Email,
    Meeting,
    Note,
    Task,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Email => "email",
            Self::Meeting => "meeting",
            Self::Note => "note",
            Self::Task => "task",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(Self::Call),
            "email" => Ok(Self::Email),
            "meeting" => Ok(Self::Meeting),
            "note" => Ok(Self::Note),
            "task" => Ok(Self::Task),
            _ => Err(format!("Invalid activity type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub description: String,
    pub due_date: Option<String>,
    pub completed: bool,
    pub completed_at: Option<String>,
    pub contact_id: Option<String>,
    pub deal_id: Option<String>,
    pub owner_id: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal: Option<Deal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Staff>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub id: String,
    #[serde(rename = "type")]
    pub interaction_type: ActivityType,
    pub notes: Option<String>,
    pub date: String,
    pub contact_id: Option<String>,
    pub deal_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IncidentSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl IncidentSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for IncidentSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    #[default]
    Ongoing,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ongoing => "ongoing",
            Self::Resolved => "resolved",
        }
    }

    pub fn toggled(&self) -> Self {
        match self {
            Self::Ongoing => Self::Resolved,
            Self::Resolved => Self::Ongoing,
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(Self::Ongoing),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Invalid incident status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub reported_by: Option<String>,
    pub assigned_to: Option<String>,
    pub contact_id: Option<String>,
    pub platform_id: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}
