//! Transport-free handlers behind the daemon's query surface.
//!
//! The gRPC server mounting these is a thin collaborator; everything it
//! answers with comes from here.

use serde_json::Value;
use tessera_blueprint::BlueprintError;
use tessera_counter::Snapshot;
use tessera_db::{query_table, Conn, Table};

/// The daemon's version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Parse a wire table name.
pub fn parse_table(name: &str) -> Option<Table> {
    match name {
        "machine" => Some(Table::Machine),
        "blueprint" => Some(Table::Blueprint),
        "container" => Some(Table::Container),
        "connection" => Some(Table::Connection),
        "acl" => Some(Table::Acl),
        "etcd" => Some(Table::Etcd),
        "minion" => Some(Table::Minion),
        "placement" => Some(Table::Placement),
        "image" => Some(Table::Image),
        _ => None,
    }
}

/// Rows of `table` serialized to JSON.
pub fn query(conn: &Conn, table: Table) -> Value {
    query_table(conn, table)
}

/// Parse, vet, and deploy a blueprint submitted as text. A vet failure
/// reports a human-readable message and leaves the store untouched.
pub fn deploy_text(conn: &Conn, text: &str) -> Result<(), BlueprintError> {
    let blueprint = tessera_blueprint::Blueprint::from_json(text)?;
    crate::deploy(conn, blueprint);
    Ok(())
}

/// All debugging counters, verbatim.
pub fn counters() -> Vec<Snapshot> {
    tessera_counter::dump()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table() {
        assert_eq!(parse_table("machine"), Some(Table::Machine));
        assert_eq!(parse_table("nonsense"), None);
    }

    #[test]
    fn test_deploy_text_rejects_invalid_blueprint() {
        let conn = tessera_db::new();
        let text = r#"{
            "namespace": "ns",
            "containers": [
                {"id": "1", "image": {"name": "a"}, "hostname": "dup"},
                {"id": "2", "image": {"name": "b"}, "hostname": "dup"}
            ]
        }"#;

        assert!(deploy_text(&conn, text).is_err());
        // Nothing landed in the store.
        assert!(conn.get_blueprint().is_none());
    }

    #[test]
    fn test_deploy_text_accepts_valid_blueprint() {
        let conn = tessera_db::new();
        deploy_text(&conn, r#"{"namespace": "ns"}"#).expect("valid blueprint");
        assert_eq!(conn.get_blueprint_namespace(), "ns");
    }

    #[test]
    fn test_query_reflects_deploys() {
        let conn = tessera_db::new();
        deploy_text(&conn, r#"{"namespace": "ns"}"#).expect("valid blueprint");

        let rows = query(&conn, Table::Blueprint);
        assert_eq!(rows.as_array().map(Vec::len), Some(1));
        assert_eq!(rows[0]["namespace"], "ns");
    }

    #[test]
    fn test_version_nonempty() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_counters_snapshot() {
        tessera_counter::new("Api").inc("Query");
        assert!(counters()
            .iter()
            .any(|s| s.module == "Api" && s.name == "Query" && s.value >= 1));
    }
}
