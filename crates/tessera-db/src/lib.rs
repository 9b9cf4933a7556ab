//! In-memory transactional datastore shared by the control loops.
//!
//! Every core entity lives as a row in a named table. The reconciler,
//! the foreman, and the scheduler never talk to each other directly;
//! they synchronize exclusively through transactions over these tables
//! and through the change triggers the store emits after each commit.
//!
//! # Invariants
//!
//! - Commits are atomic per transaction: observers see the full effect
//!   of a transaction or none of it.
//! - Only one writing transaction may be active over a given table at a
//!   time; reads inside a transaction see a stable snapshot.
//! - Trigger deliveries are coalesced. A slow reader learns that
//!   something changed, never how many times.
//! - The store is memory-resident and makes no durability guarantee;
//!   its contents are recoverable from live polling.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

/// The named tables of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Machine,
    Blueprint,
    Container,
    Connection,
    Acl,
    Etcd,
    Minion,
    Placement,
    Image,
}

/// All tables, in canonical lock order.
pub const ALL_TABLES: [Table; 9] = [
    Table::Machine,
    Table::Blueprint,
    Table::Container,
    Table::Connection,
    Table::Acl,
    Table::Etcd,
    Table::Minion,
    Table::Placement,
    Table::Image,
];

/// Raised when a provider or role string does not parse.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind} \"{value}\"")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Backing storage for one table.
#[doc(hidden)]
pub enum TableData {
    Machine(BTreeMap<u64, Machine>),
    Blueprint(BTreeMap<u64, Blueprint>),
    Container(BTreeMap<u64, Container>),
    Connection(BTreeMap<u64, Connection>),
    Acl(BTreeMap<u64, Acl>),
    Etcd(BTreeMap<u64, Etcd>),
    Minion(BTreeMap<u64, Minion>),
    Placement(BTreeMap<u64, Placement>),
    Image(BTreeMap<u64, Image>),
}

impl TableData {
    fn new(table: Table) -> TableData {
        match table {
            Table::Machine => TableData::Machine(BTreeMap::new()),
            Table::Blueprint => TableData::Blueprint(BTreeMap::new()),
            Table::Container => TableData::Container(BTreeMap::new()),
            Table::Connection => TableData::Connection(BTreeMap::new()),
            Table::Acl => TableData::Acl(BTreeMap::new()),
            Table::Etcd => TableData::Etcd(BTreeMap::new()),
            Table::Minion => TableData::Minion(BTreeMap::new()),
            Table::Placement => TableData::Placement(BTreeMap::new()),
            Table::Image => TableData::Image(BTreeMap::new()),
        }
    }
}

/// Implemented by the row types in this crate; maps a row type onto its
/// table and storage. Not intended for implementation outside the crate.
pub trait TableRow: Clone + PartialEq + Default + Send + Sized + 'static {
    const TABLE: Table;
    fn row_id(&self) -> u64;
    fn set_row_id(&mut self, id: u64);
    #[doc(hidden)]
    fn rows(data: &TableData) -> &BTreeMap<u64, Self>;
    #[doc(hidden)]
    fn rows_mut(data: &mut TableData) -> &mut BTreeMap<u64, Self>;
}

macro_rules! impl_table_row {
    ($ty:ident, $variant:ident) => {
        impl $crate::TableRow for $ty {
            const TABLE: $crate::Table = $crate::Table::$variant;

            fn row_id(&self) -> u64 {
                self.id
            }

            fn set_row_id(&mut self, id: u64) {
                self.id = id;
            }

            fn rows(data: &$crate::TableData) -> &std::collections::BTreeMap<u64, Self> {
                match data {
                    $crate::TableData::$variant(rows) => rows,
                    _ => unreachable!(),
                }
            }

            fn rows_mut(
                data: &mut $crate::TableData,
            ) -> &mut std::collections::BTreeMap<u64, Self> {
                match data {
                    $crate::TableData::$variant(rows) => rows,
                    _ => unreachable!(),
                }
            }
        }
    };
}
pub(crate) use impl_table_row;

mod acl;
mod blueprint;
mod connection;
mod container;
mod etcd;
mod image;
mod machine;
mod minion;
mod placement;
mod query;

pub use acl::Acl;
pub use blueprint::Blueprint;
pub use connection::Connection;
pub use container::Container;
pub use etcd::Etcd;
pub use image::{Image, IMAGE_BUILDING, IMAGE_BUILT};
pub use machine::{sort_machines, Machine, ProviderName, Role, Status};
pub use minion::Minion;
pub use placement::Placement;
pub use query::query_table;

struct TableSlot {
    data: Mutex<TableData>,
    watchers: Mutex<Vec<mpsc::Sender<()>>>,
}

struct Shared {
    tables: Vec<TableSlot>,
    next_row_id: AtomicU64,
}

/// A cheap-clone handle to the store.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
}

/// Create an empty store and return a handle to it.
pub fn new() -> Conn {
    Conn {
        shared: Arc::new(Shared {
            tables: ALL_TABLES
                .iter()
                .map(|t| TableSlot {
                    data: Mutex::new(TableData::new(*t)),
                    watchers: Mutex::new(Vec::new()),
                })
                .collect(),
            next_row_id: AtomicU64::new(1),
        }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned table still holds consistent rows; the panic that
    // poisoned it never commits partial state.
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Conn {
    /// Run `f` as a transaction over `tables`.
    ///
    /// Table locks are acquired in canonical order, so overlapping
    /// transactions cannot deadlock. Triggers for mutated tables fire
    /// after the locks are released.
    pub fn txn<T>(&self, tables: &[Table], f: impl FnOnce(&mut View<'_>) -> T) -> T {
        let mut wanted = tables.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let guards = wanted
            .iter()
            .map(|t| (*t, lock(&self.shared.tables[*t as usize].data)))
            .collect();
        let mut view = View {
            guards,
            dirty: Vec::new(),
            next_row_id: &self.shared.next_row_id,
        };
        let result = f(&mut view);
        let dirty = std::mem::take(&mut view.dirty);
        drop(view);

        for table in dirty {
            self.notify(table);
        }
        result
    }

    fn notify(&self, table: Table) {
        let mut watchers = lock(&self.shared.tables[table as usize].watchers);
        watchers.retain(|w| {
            !matches!(w.try_send(()), Err(mpsc::error::TrySendError::Closed(_)))
        });
    }

    fn register(&self, tables: &[Table]) -> (mpsc::Sender<()>, Trigger) {
        let (tx, rx) = mpsc::channel(1);
        for t in tables {
            lock(&self.shared.tables[*t as usize].watchers).push(tx.clone());
        }
        (tx, Trigger { rx })
    }

    /// A change-notification channel over `tables`. The channel carries
    /// a signal, not a payload, and deliveries are coalesced.
    pub fn trigger(&self, tables: &[Table]) -> Trigger {
        self.register(tables).1
    }

    /// As [`Conn::trigger`], but also fires immediately and then every
    /// `period_secs` seconds even absent changes. Must be called from
    /// within a tokio runtime.
    pub fn trigger_tick(&self, period_secs: u64, tables: &[Table]) -> Trigger {
        let (tx, trigger) = self.register(tables);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(period_secs));
            loop {
                tick.tick().await;
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(()) {
                    break;
                }
            }
        });
        trigger
    }

    /// One-off filtered read outside any larger transaction.
    pub fn select_from<R: TableRow>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        self.txn(&[R::TABLE], |view| view.select_from(pred))
    }

    /// The blueprint row, when one is deployed.
    pub fn get_blueprint(&self) -> Option<Blueprint> {
        self.txn(&[Table::Blueprint], |view| view.get_blueprint())
    }

    /// The deployed namespace, or empty when nothing is deployed.
    pub fn get_blueprint_namespace(&self) -> String {
        self.get_blueprint()
            .map(|bp| bp.namespace)
            .unwrap_or_default()
    }

    /// The minion's own row, on minion-side stores.
    pub fn minion_self(&self) -> Option<Minion> {
        self.txn(&[Table::Minion], |view| view.minion_self())
    }
}

/// A live transaction over a set of tables.
pub struct View<'a> {
    guards: Vec<(Table, MutexGuard<'a, TableData>)>,
    dirty: Vec<Table>,
    next_row_id: &'a AtomicU64,
}

impl View<'_> {
    fn data<R: TableRow>(&self) -> &TableData {
        match self.guards.iter().find(|(t, _)| *t == R::TABLE) {
            Some((_, guard)) => guard,
            None => panic!("table {:?} is not part of this transaction", R::TABLE),
        }
    }

    fn data_mut<R: TableRow>(&mut self) -> &mut TableData {
        match self.guards.iter_mut().find(|(t, _)| *t == R::TABLE) {
            Some((_, guard)) => guard,
            None => panic!("table {:?} is not part of this transaction", R::TABLE),
        }
    }

    fn mark_dirty(&mut self, table: Table) {
        if !self.dirty.contains(&table) {
            self.dirty.push(table);
        }
    }

    /// Rows of `R`'s table satisfying `pred`, returned by value.
    pub fn select_from<R: TableRow>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        R::rows(self.data::<R>())
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    /// Insert an empty row with a freshly allocated ID and return it for
    /// the caller to populate and commit.
    pub fn insert<R: TableRow>(&mut self) -> R {
        let id = self.next_row_id.fetch_add(1, Ordering::SeqCst);
        let mut row = R::default();
        row.set_row_id(id);
        R::rows_mut(self.data_mut::<R>()).insert(id, row.clone());
        self.mark_dirty(R::TABLE);
        row
    }

    /// Write `row` back under its primary key. Committing an unchanged
    /// row is a no-op and fires no trigger.
    pub fn commit<R: TableRow>(&mut self, row: R) {
        let table = R::TABLE;
        let rows = R::rows_mut(self.data_mut::<R>());
        if rows.get(&row.row_id()) == Some(&row) {
            return;
        }
        rows.insert(row.row_id(), row);
        self.mark_dirty(table);
    }

    /// Delete `row` by primary key.
    pub fn remove<R: TableRow>(&mut self, row: &R) {
        let table = R::TABLE;
        if R::rows_mut(self.data_mut::<R>())
            .remove(&row.row_id())
            .is_some()
        {
            self.mark_dirty(table);
        }
    }

    /// The blueprint row, when one is deployed.
    pub fn get_blueprint(&self) -> Option<Blueprint> {
        self.select_from::<Blueprint>(|_| true).into_iter().next()
    }

    /// The minion's own row.
    pub fn minion_self(&self) -> Option<Minion> {
        self.select_from::<Minion>(|m| m.is_self).into_iter().next()
    }
}

/// A coalesced change-notification channel.
pub struct Trigger {
    rx: mpsc::Receiver<()>,
}

impl Trigger {
    /// Wait for the next signal. Any number of commits while the caller
    /// was busy collapse into one delivery. Returns `None` only when the
    /// store has gone away.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_select_commit_remove() {
        let conn = new();

        let inserted = conn.txn(&[Table::Machine], |view| {
            let mut m: Machine = view.insert();
            m.size = "m3.medium".into();
            view.commit(m.clone());
            m
        });
        assert_ne!(inserted.id, 0);

        let machines = conn.select_from::<Machine>(|_| true);
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].size, "m3.medium");

        conn.txn(&[Table::Machine], |view| {
            let m = view.select_from::<Machine>(|_| true).remove(0);
            view.remove(&m);
        });
        assert!(conn.select_from::<Machine>(|_| true).is_empty());
    }

    #[test]
    fn test_row_ids_increase() {
        let conn = new();
        let ids = conn.txn(&[Table::Container], |view| {
            (0..3)
                .map(|_| view.insert::<Container>().id)
                .collect::<Vec<_>>()
        });
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    }

    #[test]
    fn test_select_returns_copies() {
        let conn = new();
        conn.txn(&[Table::Machine], |view| {
            let m: Machine = view.insert();
            view.commit(m);
        });

        let mut copy = conn.select_from::<Machine>(|_| true).remove(0);
        copy.size = "mutated".into();

        // The store is unaffected by mutating the copy.
        assert_eq!(conn.select_from::<Machine>(|_| true)[0].size, "");
    }

    #[test]
    #[should_panic(expected = "not part of this transaction")]
    fn test_unlocked_table_access_panics() {
        let conn = new();
        conn.txn(&[Table::Machine], |view| {
            view.select_from::<Container>(|_| true);
        });
    }

    #[tokio::test]
    async fn test_trigger_fires_after_commit() {
        let conn = new();
        let mut trigger = conn.trigger(&[Table::Machine]);

        conn.txn(&[Table::Machine], |view| {
            let m: Machine = view.insert();
            view.commit(m);
        });

        assert!(trigger.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_trigger_coalesces() {
        let conn = new();
        let mut trigger = conn.trigger(&[Table::Machine]);

        for _ in 0..5 {
            conn.txn(&[Table::Machine], |view| {
                let m: Machine = view.insert();
                view.commit(m);
            });
        }

        // Five commits, one pending signal.
        assert!(trigger.rx.try_recv().is_ok());
        assert!(trigger.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unchanged_commit_fires_no_trigger() {
        let conn = new();
        let m = conn.txn(&[Table::Machine], |view| {
            let m: Machine = view.insert();
            view.commit(m.clone());
            m
        });

        let mut trigger = conn.trigger(&[Table::Machine]);
        conn.txn(&[Table::Machine], |view| view.commit(m));
        assert!(trigger.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trigger_untouched_table_silent() {
        let conn = new();
        let mut trigger = conn.trigger(&[Table::Container]);

        conn.txn(&[Table::Machine], |view| {
            let m: Machine = view.insert();
            view.commit(m);
        });

        assert!(trigger.rx.try_recv().is_err());
    }

    #[test]
    fn test_get_machine_by_ip_requires_unique_match() {
        let conn = new();
        conn.txn(&[Table::Machine], |view| {
            for _ in 0..2 {
                let mut m: Machine = view.insert();
                m.public_ip = "1.2.3.4".into();
                view.commit(m);
            }
            let mut m: Machine = view.insert();
            m.public_ip = "5.6.7.8".into();
            view.commit(m);

            assert!(view.get_machine_by_ip("5.6.7.8").is_some());
            // Ambiguous and unknown lookups both come back empty.
            assert!(view.get_machine_by_ip("1.2.3.4").is_none());
            assert!(view.get_machine_by_ip("9.9.9.9").is_none());
        });
    }

    #[tokio::test]
    async fn test_trigger_tick_fires_immediately() {
        let conn = new();
        let mut trigger = conn.trigger_tick(3600, &[Table::Machine]);
        // The first interval tick is immediate.
        tokio::time::timeout(Duration::from_secs(1), trigger.recv())
            .await
            .expect("expected an immediate tick")
            .expect("store alive");
    }
}
