//! Command execution. OP_MSG commands are routed by the first key of the
//! section-0 document (drivers rely on that convention); legacy opcodes call
//! the `execute_*` helpers directly.

use crate::error::Result;
use crate::info::ServerInfo;
use crate::metrics::MetricsSource;
use crate::protocol::message::{QueryRequest, REPLY_QUERY_FAILURE};
use crate::store::DocumentStore;
use bson::{doc, Bson, Document};

pub const ERROR_COMMAND_NOT_FOUND: i32 = 59;
pub const ERROR_UNKNOWN: i32 = 0;

pub struct CommandContext<'a> {
    pub store: &'a dyn DocumentStore,
    pub info: &'a ServerInfo,
    pub metrics: &'a dyn MetricsSource,
    pub connection_id: i64,
}

/// Run one OP_MSG command document to completion. Always produces a reply
/// document; failures come back as `ok: 0.0` error documents.
pub fn run_command(cmd: &Document, ctx: &CommandContext<'_>) -> Document {
    let Some(name) = cmd.keys().next().cloned() else {
        return error_doc(ERROR_UNKNOWN, "empty command document");
    };
    let result = match name.as_str() {
        "hello" | "isMaster" | "ismaster" => Ok(hello_doc(ctx.info, ctx.connection_id)),
        "ping" => Ok(doc! { "ok": 1.0 }),
        "buildInfo" => Ok(with_ok(ctx.info.build())),
        "hostInfo" => Ok(with_ok(ctx.info.host())),
        "top" => top_doc(ctx.store, ctx.metrics),
        "getParameter" => Ok(doc! {
            "ok": 1.0,
            "featureCompatibilityVersion": { "version": "8.0" },
        }),
        "listDatabases" => list_databases_doc(ctx.store),
        "dbStats" => db_stats_doc(ctx.store),
        "connectionStatus" => Ok(doc! {
            "authInfo": {
                "authenticatedUsers": [],
                "authenticatedUserRoles": [],
                "authenticatedUserPrivileges": [],
            },
            "ok": 1.0,
        }),
        other => {
            return error_doc(
                ERROR_COMMAND_NOT_FOUND,
                &format!("no such command: '{}'", other),
            );
        }
    };
    match result {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(command = %name, error = %e, "command failed");
            error_doc(ERROR_UNKNOWN, &e.to_string())
        }
    }
}

/// The capability document shared by `hello`, `isMaster`, and the legacy
/// OP_QUERY handshake.
pub fn hello_doc(info: &ServerInfo, connection_id: i64) -> Document {
    let mut doc = info.base();
    doc.insert("isWritablePrimary", true);
    doc.insert("helloOk", true);
    doc.insert("ismaster", true);
    doc.insert(
        "topologyVersion",
        doc! { "processId": info.process_id, "counter": 0i64 },
    );
    doc.insert("connectionId", connection_id);
    doc.insert("localTime", bson::DateTime::now());
    doc.insert("ok", 1.0);
    doc
}

fn with_ok(mut doc: Document) -> Document {
    doc.insert("ok", 1.0);
    doc
}

fn top_doc(store: &dyn DocumentStore, metrics: &dyn MetricsSource) -> Result<Document> {
    let mut totals = doc! { "note": "all times in microseconds" };
    for db in store.list_database_names()? {
        for coll in store.list_collection_names(&db)? {
            let zero = doc! { "time": 0i64, "count": 0i64 };
            let read_lock = doc! { "time": metrics.lock_time(), "count": metrics.lock_count() };
            let write_lock = doc! { "time": metrics.lock_time(), "count": metrics.lock_count() };
            let total = doc! {
                "time": read_lock.get_i64("time").unwrap_or(0)
                    + write_lock.get_i64("time").unwrap_or(0),
                "count": read_lock.get_i64("count").unwrap_or(0)
                    + write_lock.get_i64("count").unwrap_or(0),
            };
            totals.insert(
                format!("{}.{}", db, coll),
                doc! {
                    "queries": zero.clone(),
                    "getmore": zero.clone(),
                    "insert": zero.clone(),
                    "update": zero.clone(),
                    "remove": zero.clone(),
                    "commands": zero,
                    "readLock": read_lock,
                    "writeLock": write_lock,
                    "total": total,
                },
            );
        }
    }
    Ok(doc! { "totals": totals, "ok": 1.0 })
}

fn list_databases_doc(store: &dyn DocumentStore) -> Result<Document> {
    let mut names = store.list_database_names()?;
    // The internal admin registry is always present even before any write.
    if !names.iter().any(|n| n == "admin") {
        names.push("admin".to_string());
    }
    names.sort();
    let databases: Vec<Bson> = names
        .into_iter()
        .map(|name| Bson::Document(doc! { "name": name }))
        .collect();
    Ok(doc! { "ok": 1.0, "databases": databases })
}

fn db_stats_doc(store: &dyn DocumentStore) -> Result<Document> {
    let stats = store.stats("admin")?;
    let avg_obj_size = if stats.objects > 0 {
        stats.data_size as f64 / stats.objects as f64
    } else {
        0.0
    };
    Ok(doc! {
        "db": "admin",
        "collections": stats.collections,
        "objects": stats.objects,
        "avgObjSize": avg_obj_size,
        "dataSize": stats.data_size,
        "storageSize": stats.data_size,
        "indexes": 0i64,
        "indexSize": 0i64,
        "totalSize": stats.data_size,
        "scaleFactor": 1i32,
        "fsUsedSize": stats.data_size,
        "fsTotalSize": 1_073_741_824i64,
        "ok": 1.0,
    })
}

pub fn error_doc(code: i32, errmsg: &str) -> Document {
    doc! {
        "ok": 0.0,
        "errmsg": errmsg,
        "code": code,
        "codeName": code_name(code),
    }
}

pub fn code_name(code: i32) -> &'static str {
    match code {
        ERROR_COMMAND_NOT_FOUND => "CommandNotFound",
        _ => "UnknownError",
    }
}

/// `"<db>.<collection>"` as sent in legacy opcode bodies.
pub fn split_namespace(full_collection_name: &str) -> Option<(&str, &str)> {
    full_collection_name
        .split_once('.')
        .filter(|(db, coll)| !db.is_empty() && !coll.is_empty())
}

/// Legacy OP_QUERY execution: unwrap `$query`/`$orderby`, then scan the
/// store. Failures surface as the QueryFailure response bit with no
/// documents; the projection selector is accepted and ignored.
pub fn execute_query(store: &dyn DocumentStore, req: &QueryRequest) -> (i32, Vec<Document>) {
    let Some((db, coll)) = split_namespace(&req.full_collection_name) else {
        return (REPLY_QUERY_FAILURE, Vec::new());
    };
    let actual_query = req
        .query
        .get_document("$query")
        .unwrap_or(&req.query);
    let order_by = req.query.get_document("$orderby").ok();

    let skip = req.number_to_skip.max(0) as usize;
    let limit = match req.number_to_return {
        0 => None,
        n => Some(n.unsigned_abs() as usize),
    };
    match store.find(db, coll, actual_query, order_by, skip, limit) {
        Ok(docs) => (0, docs),
        Err(e) => {
            tracing::warn!(ns = %req.full_collection_name, error = %e, "query failed");
            (REPLY_QUERY_FAILURE, Vec::new())
        }
    }
}
