//! JSON export of table contents for the daemon's query surface.

use serde::Serialize;
use serde_json::Value;

use crate::{
    Acl, Blueprint, Conn, Connection, Container, Etcd, Image, Machine, Minion, Placement, Table,
};

/// Serialize all rows of `table` to JSON.
pub fn query_table(conn: &Conn, table: Table) -> Value {
    match table {
        Table::Machine => to_value(crate::sort_machines(conn.select_from::<Machine>(|_| true))),
        Table::Blueprint => to_value(conn.select_from::<Blueprint>(|_| true)),
        Table::Container => to_value(conn.select_from::<Container>(|_| true)),
        Table::Connection => to_value(conn.select_from::<Connection>(|_| true)),
        Table::Acl => to_value(conn.select_from::<Acl>(|_| true)),
        Table::Etcd => to_value(conn.select_from::<Etcd>(|_| true)),
        Table::Minion => to_value(conn.select_from::<Minion>(|_| true)),
        Table::Placement => to_value(conn.select_from::<Placement>(|_| true)),
        Table::Image => to_value(conn.select_from::<Image>(|_| true)),
    }
}

fn to_value<T: Serialize>(rows: Vec<T>) -> Value {
    serde_json::to_value(rows).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_machines() {
        let conn = crate::new();
        conn.txn(&[Table::Machine], |view| {
            let mut m: Machine = view.insert();
            m.size = "m3.medium".into();
            m.public_ip = "1.2.3.4".into();
            view.commit(m);
        });

        let value = query_table(&conn, Table::Machine);
        let rows = value.as_array().expect("array of rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["size"], "m3.medium");
        assert_eq!(rows[0]["public_ip"], "1.2.3.4");
    }

    #[test]
    fn test_query_empty_table() {
        let conn = crate::new();
        let value = query_table(&conn, Table::Etcd);
        assert_eq!(value, serde_json::json!([]));
    }
}
