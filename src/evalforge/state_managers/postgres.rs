//! PostgreSQL state manager: creates a run-scoped database, restores a seed dump into it, and
//! drops the database on cleanup. The original harness left this service unimplemented
//! (`"components": {"state_manager": None}` in its service table); this crate supplies the
//! concrete implementation the design calls for.

use std::collections::HashMap;
use std::error::Error;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};

use crate::model::{InitialStateInfo, Task};
use crate::state_manager::StateManager;

pub struct PostgresStateManager {
    host: String,
    port: u16,
    admin_database: String,
    username: String,
    password: String,
}

impl PostgresStateManager {
    pub fn new(host: String, port: u16, admin_database: String, username: String, password: String) -> Self {
        PostgresStateManager {
            host,
            port,
            admin_database,
            username,
            password,
        }
    }

    fn conn_string(&self, database: &str) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, database, self.username, self.password
        )
    }

    async fn connect(&self, database: &str) -> Result<Client, Box<dyn Error + Send + Sync>> {
        let (client, connection) = tokio_postgres::connect(&self.conn_string(database), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("postgres connection error: {e}");
            }
        });
        Ok(client)
    }

    fn db_name(task: &Task, run_id: uuid::Uuid) -> String {
        format!("evalforge_{}_{}", task.name.replace('-', "_"), run_id.simple())
    }
}

#[async_trait]
impl StateManager for PostgresStateManager {
    async fn set(
        &self,
        task: &Task,
        run_id: uuid::Uuid,
    ) -> Result<InitialStateInfo, Box<dyn Error + Send + Sync>> {
        let db_name = Self::db_name(task, run_id);

        let admin = self.connect(&self.admin_database).await?;
        admin
            .batch_execute(&format!("CREATE DATABASE \"{db_name}\""))
            .await?;

        if let Some(seed_sql) = task.meta.extra.get("seed_sql").and_then(|v| v.as_str()) {
            let conn = self.connect(&db_name).await?;
            conn.batch_execute(seed_sql).await?;
        } else {
            let seed_path = task.root.join("seed.sql");
            if seed_path.is_file() {
                let seed_sql = std::fs::read_to_string(&seed_path)?;
                let conn = self.connect(&db_name).await?;
                conn.batch_execute(&seed_sql).await?;
            }
        }

        let mut locators = HashMap::new();
        locators.insert("database".to_string(), db_name.clone());
        locators.insert("host".to_string(), self.host.clone());
        locators.insert("port".to_string(), self.port.to_string());

        Ok(InitialStateInfo {
            locators,
            state_handle: db_name,
        })
    }

    async fn retrieve(
        &self,
        state: &InitialStateInfo,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let conn = self.connect(&state.state_handle).await?;
        let rows = conn
            .query(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
                &[],
            )
            .await?;
        let tables: Vec<String> = rows.iter().map(|r| r.get::<_, String>(0)).collect();
        Ok(serde_json::json!({ "tables": tables }))
    }

    async fn clean(&self, state: &InitialStateInfo) -> Result<(), Box<dyn Error + Send + Sync>> {
        let admin = self.connect(&self.admin_database).await?;
        // Drop is idempotent via IF EXISTS — a retried pipeline may call clean twice.
        admin
            .batch_execute(&format!(
                "DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)",
                state.state_handle
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceName, TaskMeta};
    use std::path::PathBuf;

    fn task(name: &str) -> Task {
        Task {
            service: ServiceName::Postgres,
            category: "db".to_string(),
            name: name.to_string(),
            root: PathBuf::new(),
            description_template: String::new(),
            meta: TaskMeta {
                category_id: 1,
                category_name: "Database".to_string(),
                tags: vec![],
                timeout_seconds: 60,
                extra: Default::default(),
            },
        }
    }

    #[test]
    fn db_name_replaces_hyphens_and_includes_simple_run_id() {
        let run_id = uuid::Uuid::nil();
        let name = PostgresStateManager::db_name(&task("checkout-flow"), run_id);
        assert_eq!(name, format!("evalforge_checkout_flow_{}", run_id.simple()));
        assert!(!name.contains('-'));
    }

    #[test]
    fn conn_string_targets_the_requested_database() {
        let mgr = PostgresStateManager::new(
            "db.local".to_string(),
            5432,
            "postgres".to_string(),
            "eval".to_string(),
            "secret".to_string(),
        );
        let conn = mgr.conn_string("evalforge_checkout_flow_abc");
        assert!(conn.contains("host=db.local"));
        assert!(conn.contains("dbname=evalforge_checkout_flow_abc"));
        assert!(conn.contains("user=eval"));
    }
}
