//! PostgreSQL database resource

use anyhow::Result;
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};

use super::{MAINTENANCE_DB, Psql, quote_ident, quote_literal};

/// A database that must exist
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pub name: String,
    psql: Psql,
}

impl PgDatabase {
    pub fn new(name: &str, psql: Psql) -> Self {
        Self {
            name: name.to_string(),
            psql,
        }
    }

    pub fn id_for(name: &str) -> String {
        format!("database:{name}")
    }
}

/// Whether a database exists in the cluster
pub fn database_exists(psql: &Psql, name: &str) -> Result<bool> {
    psql.exists(
        MAINTENANCE_DB,
        &format!(
            "SELECT 1 FROM pg_database WHERE datname = {};",
            quote_literal(name)
        ),
    )
}

impl Resource for PgDatabase {
    fn id(&self) -> String {
        Self::id_for(&self.name)
    }

    fn description(&self) -> String {
        format!("Database {}", self.name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Database
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(if database_exists(&self.psql, &self.name)? {
            ResourceState::Present { details: None }
        } else {
            ResourceState::Absent
        })
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present { details: None }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        // CREATE DATABASE cannot run inside a transaction block; psql sends it alone
        self.psql.execute(
            MAINTENANCE_DB,
            &format!("CREATE DATABASE {};", quote_ident(&self.name)),
        )
    }
}
