//! Declarative connector definitions

use serde::Serialize;

use crate::config::ConnectorDefinition;
use crate::connector::client::ConnectorConfig;
use crate::events::cdc::cdc_topic;

pub const POSTGRES_CONNECTOR_CLASS: &str = "io.debezium.connector.postgresql.PostgresConnector";

/// Desired state of one connector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorSpec {
    pub name: String,
    pub config: ConnectorConfig,
}

impl ConnectorSpec {
    pub fn new(name: impl Into<String>, config: ConnectorConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Debezium Postgres connector that routes `<prefix>.<schema>.<table>` to `cdc.<table>`
    pub fn postgres(def: &ConnectorDefinition) -> Self {
        let tables = def
            .tables
            .iter()
            .map(|t| format!("{}.{}", def.schema, t))
            .collect::<Vec<_>>()
            .join(",");

        let pairs = [
            ("connector.class", POSTGRES_CONNECTOR_CLASS.to_string()),
            ("tasks.max", "1".to_string()),
            ("plugin.name", "pgoutput".to_string()),
            ("database.hostname", def.database_host.clone()),
            ("database.port", def.database_port.to_string()),
            ("database.user", def.database_user.clone()),
            ("database.password", def.database_password.clone()),
            ("database.dbname", def.database_name.clone()),
            ("database.server.name", def.server_name.clone()),
            ("topic.prefix", def.topic_prefix.clone()),
            ("slot.name", def.slot_name.clone()),
            ("publication.autocreate.mode", "filtered".to_string()),
            ("schema.include.list", def.schema.clone()),
            ("table.include.list", tables),
            ("snapshot.mode", "initial".to_string()),
            ("heartbeat.interval.ms", "60000".to_string()),
            ("key.converter", "org.apache.kafka.connect.json.JsonConverter".to_string()),
            ("key.converter.schemas.enable", "false".to_string()),
            ("value.converter", "org.apache.kafka.connect.json.JsonConverter".to_string()),
            ("value.converter.schemas.enable", "false".to_string()),
            ("transforms", "route".to_string()),
            (
                "transforms.route.type",
                "org.apache.kafka.connect.transforms.RegexRouter".to_string(),
            ),
            ("transforms.route.regex", route_regex(&def.topic_prefix)),
            ("transforms.route.replacement", "cdc.$2".to_string()),
        ];

        Self::new(
            def.name.clone(),
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

fn route_regex(prefix: &str) -> String {
    format!(r"{}\.([^.]+)\.([^.]+)", prefix.replace('.', r"\."))
}

/// Topic a raw Debezium topic lands on after the route transform
///
/// Returns `None` for topics the transform leaves untouched.
pub fn routed_topic(prefix: &str, raw_topic: &str) -> Option<String> {
    let rest = raw_topic.strip_prefix(prefix)?.strip_prefix('.')?;
    match rest.split('.').collect::<Vec<_>>().as_slice() {
        [schema, table] if !schema.is_empty() && !table.is_empty() => Some(cdc_topic(table)),
        _ => None,
    }
}

/// Keys of `desired` whose value differs in (or is missing from) `current`
///
/// Keys Connect adds on its own (such as `name`) are ignored.
pub fn diverging_keys(current: &ConnectorConfig, desired: &ConnectorConfig) -> Vec<String> {
    desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> ConnectorDefinition {
        ConnectorDefinition {
            name: "postgres-cdc-connector".into(),
            database_host: "db".into(),
            database_port: 5432,
            database_name: "app".into(),
            database_user: "postgres".into(),
            database_password: "secret".into(),
            server_name: "app-db".into(),
            topic_prefix: "pg".into(),
            schema: "public".into(),
            tables: vec!["forms".into(), "responses".into()],
            slot_name: "pg_slot".into(),
        }
    }

    #[test]
    fn test_postgres_spec() {
        let spec = ConnectorSpec::postgres(&definition());
        assert_eq!(spec.name, "postgres-cdc-connector");
        assert_eq!(spec.config["plugin.name"], "pgoutput");
        assert_eq!(spec.config["slot.name"], "pg_slot");
        assert_eq!(spec.config["table.include.list"], "public.forms,public.responses");
        assert_eq!(spec.config["transforms.route.regex"], r"pg\.([^.]+)\.([^.]+)");
        assert_eq!(spec.config["transforms.route.replacement"], "cdc.$2");
    }

    #[test]
    fn test_table_routes_to_cdc_topic() {
        assert_eq!(routed_topic("pg", "pg.public.forms"), Some("cdc.forms".into()));
        assert_eq!(
            routed_topic("app.db", "app.db.public.users"),
            Some("cdc.users".into())
        );
        assert_eq!(routed_topic("pg", "pg.heartbeat"), None);
        assert_eq!(routed_topic("pg", "other.public.forms"), None);
    }

    #[test]
    fn test_diverging_keys_ignores_server_added_keys() {
        let desired = ConnectorSpec::postgres(&definition()).config;
        let mut current = desired.clone();
        current.insert("name".into(), "postgres-cdc-connector".into());
        assert!(diverging_keys(&current, &desired).is_empty());

        current.insert("slot.name".into(), "old_slot".into());
        current.remove("snapshot.mode");
        assert_eq!(
            diverging_keys(&current, &desired),
            vec!["slot.name".to_string(), "snapshot.mode".to_string()]
        );
    }
}
