//! PostgreSQL privilege grant resource

use anyhow::Result;
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};

use super::database::{PgDatabase, database_exists};
use super::role::{PgRole, role_exists};
use super::{Psql, quote_ident, quote_literal};

/// Privileges an application role needs on its database
const FULL: &str = "CONNECT,CREATE,TEMP,public:CREATE";

/// Database and `public` schema privileges of a role
#[derive(Debug, Clone)]
pub struct PgGrant {
    pub database: String,
    pub role: String,
    psql: Psql,
}

impl PgGrant {
    pub fn new(database: &str, role: &str, psql: Psql) -> Self {
        Self {
            database: database.to_string(),
            role: role.to_string(),
            psql,
        }
    }

    /// Comma-separated privileges the role holds, `None` if either side is missing
    fn held(&self) -> Result<Option<String>> {
        if !database_exists(&self.psql, &self.database)? || !role_exists(&self.psql, &self.role)? {
            return Ok(None);
        }

        let role = quote_literal(&self.role);
        let sql = format!(
            "SELECT concat_ws(',', \
             CASE WHEN has_database_privilege({role}, current_database(), 'CONNECT') THEN 'CONNECT' END, \
             CASE WHEN has_database_privilege({role}, current_database(), 'CREATE') THEN 'CREATE' END, \
             CASE WHEN has_database_privilege({role}, current_database(), 'TEMP') THEN 'TEMP' END, \
             CASE WHEN has_schema_privilege({role}, 'public', 'CREATE') THEN 'public:CREATE' END);"
        );
        self.psql.query(&self.database, &sql).map(Some)
    }
}

/// Classify held privileges
///
/// CONNECT and TEMP come from PUBLIC by default, so only the privileges an
/// explicit grant adds decide between absent and partially granted.
fn classify(held: Option<&str>) -> ResourceState {
    let Some(held) = held else {
        return ResourceState::Absent;
    };
    if held == FULL {
        return ResourceState::Present {
            details: Some(FULL.to_string()),
        };
    }
    let explicit = held
        .split(',')
        .any(|p| p == "CREATE" || p == "public:CREATE");
    if explicit {
        ResourceState::Modified {
            from: held.to_string(),
            to: FULL.to_string(),
        }
    } else {
        ResourceState::Absent
    }
}

impl Resource for PgGrant {
    fn id(&self) -> String {
        format!("grant:{}@{}", self.role, self.database)
    }

    fn description(&self) -> String {
        format!("Privileges of {} on {}", self.role, self.database)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Grant
    }

    fn requires(&self) -> Vec<String> {
        vec![
            PgDatabase::id_for(&self.database),
            PgRole::id_for(&self.role),
        ]
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(classify(self.held()?.as_deref()))
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present {
            details: Some(FULL.to_string()),
        }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        let role = quote_ident(&self.role);
        self.psql.execute(
            &self.database,
            &format!(
                "GRANT ALL PRIVILEGES ON DATABASE {} TO {role};\nGRANT ALL ON SCHEMA public TO {role};",
                quote_ident(&self.database)
            ),
        )
    }
}
