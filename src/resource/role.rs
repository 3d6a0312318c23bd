//! PostgreSQL login role resource

use anyhow::Result;
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};

use super::{MAINTENANCE_DB, Psql, quote_ident, quote_literal};

/// A role that must exist and be able to log in
///
/// The password cannot be read back, so an existing login role is left
/// alone; a stale password shows up in the connection test.
#[derive(Clone)]
pub struct PgRole {
    pub name: String,
    password: String,
    psql: Psql,
}

impl std::fmt::Debug for PgRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRole").field("name", &self.name).finish_non_exhaustive()
    }
}

impl PgRole {
    pub fn new(name: &str, password: &str, psql: Psql) -> Self {
        Self {
            name: name.to_string(),
            password: password.to_string(),
            psql,
        }
    }

    pub fn id_for(name: &str) -> String {
        format!("role:{name}")
    }

    /// `rolcanlogin` of the role, `None` when it does not exist
    fn can_login(&self) -> Result<Option<bool>> {
        let out = self.psql.query(
            MAINTENANCE_DB,
            &format!(
                "SELECT rolcanlogin FROM pg_roles WHERE rolname = {};",
                quote_literal(&self.name)
            ),
        )?;
        Ok(match out.as_str() {
            "" => None,
            value => Some(value == "t"),
        })
    }
}

/// Whether a role exists in the cluster
pub fn role_exists(psql: &Psql, name: &str) -> Result<bool> {
    psql.exists(
        MAINTENANCE_DB,
        &format!(
            "SELECT 1 FROM pg_roles WHERE rolname = {};",
            quote_literal(name)
        ),
    )
}

impl Resource for PgRole {
    fn id(&self) -> String {
        Self::id_for(&self.name)
    }

    fn description(&self) -> String {
        format!("Login role {}", self.name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Role
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(match self.can_login()? {
            None => ResourceState::Absent,
            Some(true) => ResourceState::Present {
                details: Some("login".to_string()),
            },
            Some(false) => ResourceState::Modified {
                from: "nologin".to_string(),
                to: "login".to_string(),
            },
        })
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present {
            details: Some("login".to_string()),
        }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        let verb = if self.can_login()?.is_some() {
            "ALTER ROLE"
        } else {
            "CREATE ROLE"
        };
        self.psql.execute(
            MAINTENANCE_DB,
            &format!(
                "{verb} {} WITH LOGIN PASSWORD {};",
                quote_ident(&self.name),
                quote_literal(&self.password)
            ),
        )
    }
}
