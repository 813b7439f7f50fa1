//! Local relational store.
//!
//! An in-process, multi-table database shared by every control pass on this
//! node.  All access goes through [`Conn::txn`], which hands the closure a
//! [`View`] over a private copy of the tables.  The copy replaces the shared
//! state only when the closure returns `Ok`, so a pass either commits all of
//! its writes or none of them, and never observes another pass half way.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{Container, EtcdRecord, Image, Minion, Placement, RowId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Database {
    next_id: RowId,
    containers: BTreeMap<RowId, Container>,
    minions: BTreeMap<RowId, Minion>,
    etcd: BTreeMap<RowId, EtcdRecord>,
    images: BTreeMap<RowId, Image>,
    placements: BTreeMap<RowId, Placement>,
}

/// A type stored in one table of the [`Database`].
pub trait Row: Clone + Default {
    fn id(&self) -> RowId;
    fn set_id(&mut self, id: RowId);
    fn table(db: &Database) -> &BTreeMap<RowId, Self>;
    fn table_mut(db: &mut Database) -> &mut BTreeMap<RowId, Self>;
}

macro_rules! impl_row {
    ($ty:ty, $field:ident) => {
        impl Row for $ty {
            fn id(&self) -> RowId {
                self.id
            }

            fn set_id(&mut self, id: RowId) {
                self.id = id;
            }

            fn table(db: &Database) -> &BTreeMap<RowId, Self> {
                &db.$field
            }

            fn table_mut(db: &mut Database) -> &mut BTreeMap<RowId, Self> {
                &mut db.$field
            }
        }
    };
}

impl_row!(Container, containers);
impl_row!(Minion, minions);
impl_row!(EtcdRecord, etcd);
impl_row!(Image, images);
impl_row!(Placement, placements);

/// Handle to the shared database.  Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Conn {
    db: Arc<Mutex<Database>>,
}

impl Conn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a snapshot of the database and publish the snapshot
    /// if `f` succeeds.  Transactions are serialised.
    pub fn txn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut View<'_>) -> Result<T, E>,
    {
        let mut shared = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = shared.clone();
        let out = f(&mut View { db: &mut snapshot })?;
        *shared = snapshot;
        Ok(out)
    }

    /// Read-only convenience wrapper around a single `select`.
    pub fn select<T: Row>(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.read(|view| view.select(pred))
    }

    pub fn read<T>(&self, f: impl FnOnce(&View<'_>) -> T) -> T {
        let result: Result<T, Infallible> = self.txn(|view| Ok(f(view)));
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// A copy of the whole database, used to compare states in tests and
    /// debug output.
    pub fn snapshot(&self) -> Database {
        self.db
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Transaction-scoped access to the tables.
pub struct View<'a> {
    db: &'a mut Database,
}

impl View<'_> {
    /// Rows of table `T` matching `pred`, in row id order.
    pub fn select<T: Row>(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        T::table(self.db)
            .values()
            .filter(|row| pred(row))
            .cloned()
            .collect()
    }

    /// Insert a default row and return it with its freshly assigned id.
    pub fn insert<T: Row>(&mut self) -> T {
        self.db.next_id += 1;
        let mut row = T::default();
        row.set_id(self.db.next_id);
        T::table_mut(self.db).insert(row.id(), row.clone());
        row
    }

    /// Write `row` back under its id.
    pub fn commit<T: Row>(&mut self, row: T) {
        T::table_mut(self.db).insert(row.id(), row);
    }

    pub fn remove<T: Row>(&mut self, row: &T) {
        T::table_mut(self.db).remove(&row.id());
    }

    /// The minion row describing this node, if one has been written yet.
    pub fn minion_self(&self) -> Option<Minion> {
        self.select(|m: &Minion| m.is_self).into_iter().next()
    }

    pub fn etcd_record(&self) -> Option<EtcdRecord> {
        self.select(|_: &EtcdRecord| true).into_iter().next()
    }
}
