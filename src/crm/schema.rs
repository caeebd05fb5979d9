use std::str::FromStr;

/// The CRM tables. `Incidents` is read by the incident log, not the main snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Staff,
    Companies,
    Contacts,
    Platforms,
    Deals,
    Activities,
    Interactions,
    Incidents,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Self::Staff,
        Self::Companies,
        Self::Contacts,
        Self::Platforms,
        Self::Deals,
        Self::Activities,
        Self::Interactions,
        Self::Incidents,
    ];

    /// Tables whose change notifications trigger a full refresh.
    pub const WATCHED: [Table; 5] = [
        Self::Staff,
        Self::Contacts,
        Self::Deals,
        Self::Activities,
        Self::Platforms,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Staff => "staff",
            Self::Companies => "companies",
            Self::Contacts => "contacts",
            Self::Platforms => "platforms",
            Self::Deals => "deals",
            Self::Activities => "activities",
            Self::Interactions => "interactions",
            Self::Incidents => "incidents",
        }
    }

    pub fn is_watched(&self) -> bool {
        Self::WATCHED.contains(self)
    }

    pub fn columns(&self) -> &'static [Column] {
        match self {
            Self::Staff => STAFF_COLUMNS,
            Self::Companies => COMPANY_COLUMNS,
            Self::Contacts => CONTACT_COLUMNS,
            Self::Platforms => PLATFORM_COLUMNS,
            Self::Deals => DEAL_COLUMNS,
            Self::Activities => ACTIVITY_COLUMNS,
            Self::Interactions => INTERACTION_COLUMNS,
            Self::Incidents => INCIDENT_COLUMNS,
        }
    }

    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns().iter().find(|c| c.name == name)
    }

    pub fn has_updated_at(&self) -> bool {
        self.column("updated_at").is_some()
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("Unknown table: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Real,
    Integer,
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Text,
    }
}

const fn real(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Real,
    }
}

const fn integer(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Integer,
    }
}

const fn boolean(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Bool,
    }
}

const STAFF_COLUMNS: &[Column] = &[
    text("id"),
    text("name"),
    text("email"),
    text("role"),
    text("avatar_url"),
    text("created_at"),
];

const COMPANY_COLUMNS: &[Column] = &[
    text("id"),
    text("name"),
    text("industry"),
    text("size"),
    text("website"),
    text("created_at"),
    text("updated_at"),
];

const CONTACT_COLUMNS: &[Column] = &[
    text("id"),
    text("first_name"),
    text("last_name"),
    text("email"),
    text("phone"),
    text("job_title"),
    text("company_id"),
    text("company_name"),
    text("location"),
    text("main_need"),
    text("budget_range"),
    text("decision_authority"),
    text("notes"),
    text("owner_id"),
    text("created_at"),
    text("updated_at"),
];

const PLATFORM_COLUMNS: &[Column] = &[text("id"), text("name"), text("created_at")];

const DEAL_COLUMNS: &[Column] = &[
    text("id"),
    text("title"),
    real("value"),
    text("stage"),
    integer("probability"),
    text("expected_close_date"),
    text("contact_id"),
    text("company_id"),
    text("platform_id"),
    text("owner_id"),
    text("created_at"),
    text("updated_at"),
];

const ACTIVITY_COLUMNS: &[Column] = &[
    text("id"),
    text("type"),
    text("description"),
    text("due_date"),
    boolean("completed"),
    text("completed_at"),
    text("contact_id"),
    text("deal_id"),
    text("owner_id"),
    text("created_at"),
];

const INTERACTION_COLUMNS: &[Column] = &[
    text("id"),
    text("type"),
    text("notes"),
    text("date"),
    text("contact_id"),
    text("deal_id"),
    text("created_at"),
];

const INCIDENT_COLUMNS: &[Column] = &[
    text("id"),
    text("title"),
    text("description"),
    text("severity"),
    text("status"),
    text("reported_by"),
    text("assigned_to"),
    text("contact_id"),
    text("platform_id"),
    text("resolved_at"),
    text("created_at"),
    text("updated_at"),
];

/// Schema for the local SQLite store. Timestamps are RFC 3339 text.
pub const SQLITE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS staff (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL DEFAULT 'staff' CHECK (role IN ('admin', 'staff')),
    avatar_url TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS companies (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    industry TEXT,
    size TEXT,
    website TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS contacts (
    id TEXT PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    job_title TEXT,
    company_id TEXT REFERENCES companies(id) ON DELETE SET NULL,
    company_name TEXT,
    location TEXT,
    main_need TEXT,
    budget_range TEXT,
    decision_authority TEXT,
    notes TEXT,
    owner_id TEXT REFERENCES staff(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS platforms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deals (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    value REAL NOT NULL DEFAULT 0,
    stage TEXT NOT NULL,
    probability INTEGER NOT NULL DEFAULT 50,
    expected_close_date TEXT,
    contact_id TEXT REFERENCES contacts(id) ON DELETE SET NULL,
    company_id TEXT REFERENCES companies(id) ON DELETE SET NULL,
    platform_id TEXT REFERENCES platforms(id) ON DELETE SET NULL,
    owner_id TEXT REFERENCES staff(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS activities (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    description TEXT NOT NULL,
    due_date TEXT,
    completed INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT,
    contact_id TEXT REFERENCES contacts(id) ON DELETE SET NULL,
    deal_id TEXT REFERENCES deals(id) ON DELETE SET NULL,
    owner_id TEXT REFERENCES staff(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS interactions (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    notes TEXT,
    date TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    contact_id TEXT REFERENCES contacts(id) ON DELETE SET NULL,
    deal_id TEXT REFERENCES deals(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'medium',
    status TEXT NOT NULL DEFAULT 'ongoing',
    reported_by TEXT REFERENCES staff(id) ON DELETE SET NULL,
    assigned_to TEXT REFERENCES staff(id) ON DELETE SET NULL,
    contact_id TEXT REFERENCES contacts(id) ON DELETE SET NULL,
    platform_id TEXT REFERENCES platforms(id) ON DELETE SET NULL,
    resolved_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_deals_stage ON deals(stage);
CREATE INDEX IF NOT EXISTS idx_activities_due ON activities(due_date);
CREATE INDEX IF NOT EXISTS idx_interactions_date ON interactions(date);
";

/// Migration for the hosted Postgres store, shown when the tables are missing.
pub const POSTGRES_MIGRATION: &str = r#"create extension if not exists "uuid-ossp";

create table if not exists staff (
  id uuid primary key default uuid_generate_v4(),
  name text not null,
  email text unique not null,
  role text check (role in ('admin', 'staff')) default 'staff',
  avatar_url text,
  created_at timestamp with time zone default timezone('utc'::text, now())
);

create table if not exists companies (
  id uuid primary key default uuid_generate_v4(),
  name text not null,
  industry text,
  size text,
  website text,
  created_at timestamp with time zone default timezone('utc'::text, now()),
  updated_at timestamp with time zone default timezone('utc'::text, now())
);

create table if not exists contacts (
  id uuid primary key default uuid_generate_v4(),
  first_name text not null,
  last_name text not null,
  email text,
  phone text,
  job_title text,
  company_id uuid references companies(id) on delete set null,
  company_name text,
  location text,
  main_need text,
  budget_range text,
  decision_authority text,
  notes text,
  owner_id uuid references staff(id) on delete set null,
  created_at timestamp with time zone default timezone('utc'::text, now()),
  updated_at timestamp with time zone default timezone('utc'::text, now())
);

create table if not exists platforms (
  id uuid primary key default uuid_generate_v4(),
  name text unique not null,
  created_at timestamp with time zone default timezone('utc'::text, now())
);

create table if not exists deals (
  id uuid primary key default uuid_generate_v4(),
  title text not null,
  value numeric default 0 check (value >= 0),
  stage text not null check (stage in ('planned-visit', 'first-contact', 'decision-maker', 'demo', 'decision', 'closed-won', 'closed-lost')),
  probability integer default 50 check (probability between 0 and 100),
  expected_close_date date,
  contact_id uuid references contacts(id) on delete set null,
  company_id uuid references companies(id) on delete set null,
  platform_id uuid references platforms(id) on delete set null,
  owner_id uuid references staff(id) on delete set null,
  created_at timestamp with time zone default timezone('utc'::text, now()),
  updated_at timestamp with time zone default timezone('utc'::text, now())
);

create table if not exists activities (
  id uuid primary key default uuid_generate_v4(),
  type text not null,
  description text not null,
  due_date timestamp with time zone,
  completed boolean default false,
  completed_at timestamp with time zone,
  contact_id uuid references contacts(id) on delete set null,
  deal_id uuid references deals(id) on delete set null,
  owner_id uuid references staff(id) on delete set null,
  created_at timestamp with time zone default timezone('utc'::text, now())
);

create table if not exists interactions (
  id uuid primary key default uuid_generate_v4(),
  type text not null,
  notes text,
  date timestamp with time zone default timezone('utc'::text, now()),
  contact_id uuid references contacts(id) on delete set null,
  deal_id uuid references deals(id) on delete set null,
  created_at timestamp with time zone default timezone('utc'::text, now())
);

create table if not exists incidents (
  id uuid primary key default uuid_generate_v4(),
  title text not null,
  description text not null,
  severity text check (severity in ('low', 'medium', 'high', 'critical')) default 'medium',
  status text check (status in ('ongoing', 'resolved')) default 'ongoing',
  reported_by uuid references staff(id) on delete set null,
  assigned_to uuid references staff(id) on delete set null,
  contact_id uuid references contacts(id) on delete set null,
  platform_id uuid references platforms(id) on delete set null,
  resolved_at timestamp with time zone,
  created_at timestamp with time zone default timezone('utc'::text, now()),
  updated_at timestamp with time zone default timezone('utc'::text, now())
);
"#;

/// Policy SQL granting the anon role full access to every CRM table.
pub fn rls_policy_sql() -> String {
    let mut sql = String::new();
    for table in Table::ALL {
        let name = table.name();
        sql.push_str(&format!(
            "alter table {name} enable row level security;\n\
             drop policy if exists \"crm_anon_all_{name}\" on {name};\n\
             create policy \"crm_anon_all_{name}\" on {name} for all to anon using (true) with check (true);\n\n"
        ));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_roundtrip() {
        for table in Table::ALL {
            assert_eq!(Table::from_str(table.name()).unwrap(), table);
        }
        assert!(Table::from_str("users").is_err());
    }

    #[test]
    fn test_every_table_has_id_and_created_at() {
        for table in Table::ALL {
            assert!(table.column("id").is_some(), "{} lacks id", table);
            assert!(table.column("created_at").is_some(), "{} lacks created_at", table);
        }
    }

    #[test]
    fn test_sqlite_schema_creates_every_table() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(SQLITE_SCHEMA).unwrap();
        for table in Table::ALL {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                    [table.name()],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);

            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info({})", table.name()))
                .unwrap();
            let names: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            let expected: Vec<&str> = table.columns().iter().map(|c| c.name).collect();
            assert_eq!(names, expected, "column drift in {}", table);
        }
    }

    #[test]
    fn test_migration_mentions_every_table() {
        for table in Table::ALL {
            assert!(
                POSTGRES_MIGRATION.contains(&format!("create table if not exists {} (", table.name())),
                "migration lacks {}",
                table
            );
        }
    }

    #[test]
    fn test_rls_policy_covers_every_table() {
        let sql = rls_policy_sql();
        for table in Table::ALL {
            assert!(sql.contains(&format!("alter table {} enable row level security", table.name())));
        }
    }
}
