//! Embedded document store. The wire layer only sees the `DocumentStore`
//! trait; `MemStore` is the in-process implementation backing the server and
//! its tests. All operations are keyed by `(database, collection)` and
//! synchronous; the lock is never held across I/O.

use crate::error::{Error, Result};
use bson::oid::ObjectId;
use bson::{Bson, Document};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::RwLock;

pub trait DocumentStore: Send + Sync {
    fn insert_many(&self, db: &str, coll: &str, docs: Vec<Document>) -> Result<Vec<Bson>>;
    fn insert_one(&self, db: &str, coll: &str, doc: Document) -> Result<Bson>;
    /// Filtered, optionally sorted scan. `limit` of `None` returns every
    /// match past `skip`.
    fn find(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        sort: Option<&Document>,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;
    fn update_one(&self, db: &str, coll: &str, selector: &Document, update: &Document)
        -> Result<u64>;
    fn update_many(
        &self,
        db: &str,
        coll: &str,
        selector: &Document,
        update: &Document,
    ) -> Result<u64>;
    fn remove(&self, db: &str, coll: &str, filter: &Document, multi: bool) -> Result<u64>;
    fn list_database_names(&self) -> Result<Vec<String>>;
    fn list_collection_names(&self, db: &str) -> Result<Vec<String>>;
    fn stats(&self, db: &str) -> Result<DbStats>;
}

#[derive(Debug, Clone, Default)]
pub struct DbStats {
    pub collections: i64,
    pub objects: i64,
    pub data_size: i64,
}

type Collections = BTreeMap<String, Vec<Document>>;

#[derive(Default)]
pub struct MemStore {
    databases: RwLock<BTreeMap<String, Collections>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_coll<T>(
        &self,
        db: &str,
        coll: &str,
        f: impl FnOnce(&mut Vec<Document>) -> T,
    ) -> Result<T> {
        let mut guard = self
            .databases
            .write()
            .map_err(|_| Error::Msg("store lock poisoned".into()))?;
        let docs = guard
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_default();
        Ok(f(docs))
    }
}

impl DocumentStore for MemStore {
    fn insert_many(&self, db: &str, coll: &str, docs: Vec<Document>) -> Result<Vec<Bson>> {
        self.write_coll(db, coll, |stored| {
            let mut ids = Vec::with_capacity(docs.len());
            for mut doc in docs {
                let id = doc
                    .get("_id")
                    .cloned()
                    .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
                doc.insert("_id", id.clone());
                ids.push(id);
                stored.push(doc);
            }
            ids
        })
    }

    fn insert_one(&self, db: &str, coll: &str, doc: Document) -> Result<Bson> {
        let mut ids = self.insert_many(db, coll, vec![doc])?;
        Ok(ids.pop().expect("one id per inserted document"))
    }

    fn find(
        &self,
        db: &str,
        coll: &str,
        filter: &Document,
        sort: Option<&Document>,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let guard = self
            .databases
            .read()
            .map_err(|_| Error::Msg("store lock poisoned".into()))?;
        let mut matched: Vec<Document> = guard
            .get(db)
            .and_then(|colls| colls.get(coll))
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches_filter(d, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order_by) = sort {
            matched.sort_by(|a, b| compare_by(a, b, order_by));
        }
        let matched = matched.into_iter().skip(skip);
        Ok(match limit {
            Some(n) => matched.take(n).collect(),
            None => matched.collect(),
        })
    }

    fn update_one(
        &self,
        db: &str,
        coll: &str,
        selector: &Document,
        update: &Document,
    ) -> Result<u64> {
        self.write_coll(db, coll, |docs| {
            for doc in docs.iter_mut() {
                if matches_filter(doc, selector) {
                    apply_update(doc, update);
                    return 1;
                }
            }
            0
        })
    }

    fn update_many(
        &self,
        db: &str,
        coll: &str,
        selector: &Document,
        update: &Document,
    ) -> Result<u64> {
        self.write_coll(db, coll, |docs| {
            let mut n = 0;
            for doc in docs.iter_mut() {
                if matches_filter(doc, selector) {
                    apply_update(doc, update);
                    n += 1;
                }
            }
            n
        })
    }

    fn remove(&self, db: &str, coll: &str, filter: &Document, multi: bool) -> Result<u64> {
        self.write_coll(db, coll, |docs| {
            let before = docs.len();
            if multi {
                docs.retain(|d| !matches_filter(d, filter));
            } else if let Some(idx) = docs.iter().position(|d| matches_filter(d, filter)) {
                docs.remove(idx);
            }
            (before - docs.len()) as u64
        })
    }

    fn list_database_names(&self) -> Result<Vec<String>> {
        let guard = self
            .databases
            .read()
            .map_err(|_| Error::Msg("store lock poisoned".into()))?;
        Ok(guard.keys().cloned().collect())
    }

    fn list_collection_names(&self, db: &str) -> Result<Vec<String>> {
        let guard = self
            .databases
            .read()
            .map_err(|_| Error::Msg("store lock poisoned".into()))?;
        Ok(guard
            .get(db)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn stats(&self, db: &str) -> Result<DbStats> {
        let guard = self
            .databases
            .read()
            .map_err(|_| Error::Msg("store lock poisoned".into()))?;
        let mut stats = DbStats::default();
        if let Some(colls) = guard.get(db) {
            stats.collections = colls.len() as i64;
            for docs in colls.values() {
                stats.objects += docs.len() as i64;
                for doc in docs {
                    if let Ok(blob) = bson::to_vec(doc) {
                        stats.data_size += blob.len() as i64;
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// Equality match: every filter key (dotted paths allowed) must resolve to a
/// value equal to the filter's. An empty filter matches everything.
fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, want)| lookup_path(doc, key).is_some_and(|have| bson_eq(have, want)))
}

fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_document()?.get(part)?;
    }
    Some(current)
}

/// Equality with numeric cross-type tolerance (an i32 filter matches an i64
/// or double field holding the same number).
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Sort comparator for an `$orderby`-shaped document: keys in declaration
/// order, value 1 ascending, -1 descending. Missing fields sort first.
fn compare_by(a: &Document, b: &Document, order_by: &Document) -> Ordering {
    for (key, dir) in order_by.iter() {
        let ord = bson_cmp(lookup_path(a, key), lookup_path(b, key));
        let descending = matches!(numeric(dir), Some(d) if d < 0.0);
        let ord = if descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn bson_cmp(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => match (numeric(x), numeric(y)) {
            (Some(nx), Some(ny)) => nx.partial_cmp(&ny).unwrap_or(Ordering::Equal),
            _ => match (x, y) {
                (Bson::String(sx), Bson::String(sy)) => sx.cmp(sy),
                (Bson::Boolean(bx), Bson::Boolean(by)) => bx.cmp(by),
                (Bson::DateTime(dx), Bson::DateTime(dy)) => dx.cmp(dy),
                (Bson::ObjectId(ox), Bson::ObjectId(oy)) => ox.cmp(oy),
                _ => Ordering::Equal,
            },
        },
    }
}

/// Legacy update semantics: `$set`/`$unset`/`$inc` mutate fields in place,
/// anything else replaces the whole document while keeping its `_id`.
fn apply_update(doc: &mut Document, update: &Document) {
    let has_operators = update.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        let id = doc.get("_id").cloned();
        *doc = update.clone();
        if let Some(id) = id {
            doc.insert("_id", id);
        }
        return;
    }
    if let Ok(set) = update.get_document("$set") {
        for (k, v) in set.iter() {
            doc.insert(k.clone(), v.clone());
        }
    }
    if let Ok(unset) = update.get_document("$unset") {
        for (k, _) in unset.iter() {
            doc.remove(k);
        }
    }
    if let Ok(inc) = update.get_document("$inc") {
        for (k, v) in inc.iter() {
            let current = doc.get(k).and_then(|b| numeric(b)).unwrap_or(0.0);
            let step = numeric(v).unwrap_or(0.0);
            doc.insert(k.clone(), Bson::Double(current + step));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn insert_assigns_ids_and_find_returns_them() {
        let store = MemStore::new();
        let ids = store
            .insert_many(
                "test",
                "users",
                vec![doc! { "name": "a" }, doc! { "name": "b" }],
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(matches!(ids[0], Bson::ObjectId(_)));

        let all = store
            .find("test", "users", &doc! {}, None, 0, None)
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| d.contains_key("_id")));
    }

    #[test]
    fn find_filters_by_dotted_path_and_numeric_equivalence() {
        let store = MemStore::new();
        store
            .insert_many(
                "test",
                "users",
                vec![
                    doc! { "name": "a", "stats": { "age": 30i64 } },
                    doc! { "name": "b", "stats": { "age": 31i64 } },
                ],
            )
            .unwrap();
        let found = store
            .find("test", "users", &doc! { "stats.age": 30i32 }, None, 0, None)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_str("name").unwrap(), "a");
    }

    #[test]
    fn find_sorts_skips_and_limits() {
        let store = MemStore::new();
        store
            .insert_many(
                "test",
                "nums",
                vec![
                    doc! { "n": 3i32 },
                    doc! { "n": 1i32 },
                    doc! { "n": 2i32 },
                    doc! { "n": 4i32 },
                ],
            )
            .unwrap();
        let found = store
            .find(
                "test",
                "nums",
                &doc! {},
                Some(&doc! { "n": -1i32 }),
                1,
                Some(2),
            )
            .unwrap();
        let ns: Vec<i32> = found.iter().map(|d| d.get_i32("n").unwrap()).collect();
        assert_eq!(ns, vec![3, 2]);
    }

    #[test]
    fn update_one_applies_set_and_update_many_replaces() {
        let store = MemStore::new();
        store
            .insert_many(
                "test",
                "users",
                vec![doc! { "name": "a", "age": 1i32 }, doc! { "name": "a" }],
            )
            .unwrap();

        let n = store
            .update_one(
                "test",
                "users",
                &doc! { "name": "a" },
                &doc! { "$set": { "age": 9i32 } },
            )
            .unwrap();
        assert_eq!(n, 1);
        let found = store
            .find("test", "users", &doc! { "age": 9i32 }, None, 0, None)
            .unwrap();
        assert_eq!(found.len(), 1);

        let n = store
            .update_many("test", "users", &doc! { "name": "a" }, &doc! { "name": "z" })
            .unwrap();
        assert_eq!(n, 2);
        let replaced = store
            .find("test", "users", &doc! { "name": "z" }, None, 0, None)
            .unwrap();
        assert_eq!(replaced.len(), 2);
        // replacement keeps the assigned _id
        assert!(replaced.iter().all(|d| d.contains_key("_id")));
    }

    #[test]
    fn remove_honors_multi_flag() {
        let store = MemStore::new();
        store
            .insert_many(
                "test",
                "users",
                vec![doc! { "k": 1i32 }, doc! { "k": 1i32 }, doc! { "k": 2i32 }],
            )
            .unwrap();
        assert_eq!(store.remove("test", "users", &doc! { "k": 1i32 }, false).unwrap(), 1);
        assert_eq!(store.remove("test", "users", &doc! { "k": 1i32 }, true).unwrap(), 1);
        assert_eq!(store.remove("test", "users", &doc! { "k": 2i32 }, true).unwrap(), 1);
        assert!(store
            .find("test", "users", &doc! {}, None, 0, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn listings_and_stats_reflect_contents() {
        let store = MemStore::new();
        store.insert_one("app", "users", doc! { "a": 1i32 }).unwrap();
        store.insert_one("app", "events", doc! { "b": 2i32 }).unwrap();
        store.insert_one("other", "x", doc! {}).unwrap();

        assert_eq!(store.list_database_names().unwrap(), vec!["app", "other"]);
        assert_eq!(
            store.list_collection_names("app").unwrap(),
            vec!["events", "users"]
        );

        let stats = store.stats("app").unwrap();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.objects, 2);
        assert!(stats.data_size > 0);

        let empty = store.stats("missing").unwrap();
        assert_eq!(empty.collections, 0);
        assert_eq!(empty.objects, 0);
    }
}
