//! Request dispatch: one parsed header plus its raw frame in, at most one
//! framed response out. Fatal decode errors bubble up so the connection
//! worker can close; everything else is settled here (error reply, silent
//! drop, or fire-and-forget write).

use crate::commands::{
    error_doc, execute_query, run_command, split_namespace, CommandContext, ERROR_UNKNOWN,
};
use crate::error::{Error, Result};
use crate::info::ServerInfo;
use crate::metrics::MetricsSource;
use crate::protocol::message::{
    decode_compressed, decode_delete, decode_get_more, decode_insert, decode_kill_cursors,
    decode_msg, decode_query, decode_update, encode_op_msg_with, encode_op_reply, MsgRequest,
    REPLY_AWAIT_CAPABLE, REPLY_QUERY_FAILURE, MSG_CHECKSUM_PRESENT, UPDATE_MULTI, UPDATE_UPSERT,
};
use crate::protocol::{MessageHeader, OpCode};
use crate::store::DocumentStore;
use bson::{Bson, Document};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

pub struct DispatchContext {
    pub store: Arc<dyn DocumentStore>,
    pub info: Arc<ServerInfo>,
    pub metrics: Arc<dyn MetricsSource>,
    pub connection_id: i64,
    next_request_id: AtomicI32,
}

impl DispatchContext {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        info: Arc<ServerInfo>,
        metrics: Arc<dyn MetricsSource>,
        connection_id: i64,
    ) -> Self {
        Self {
            store,
            info,
            metrics,
            connection_id,
            next_request_id: AtomicI32::new(1),
        }
    }

    /// Monotonic per-connection id for outgoing frames.
    fn next_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn command_context(&self) -> CommandContext<'_> {
        CommandContext {
            store: self.store.as_ref(),
            info: self.info.as_ref(),
            metrics: self.metrics.as_ref(),
            connection_id: self.connection_id,
        }
    }
}

/// Route one frame. `Ok(Some(bytes))` is the response frame to write back,
/// `Ok(None)` means no response, `Err` tears down the connection.
pub fn dispatch(
    ctx: &DispatchContext,
    header: &MessageHeader,
    frame: &[u8],
) -> Result<Option<Vec<u8>>> {
    let op = match OpCode::from_i32(header.op_code) {
        Ok(op) => op,
        Err(Error::InvalidOpcode(code)) => {
            tracing::warn!(
                conn_id = ctx.connection_id,
                op_code = code,
                "dropping frame with unknown op code"
            );
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    match op {
        OpCode::Msg => dispatch_msg(ctx, header, frame),
        OpCode::Query => dispatch_query(ctx, header, frame),
        OpCode::Insert => {
            if let Some(req) = decode_write(ctx, op, frame, decode_insert)? {
                let ns = req.full_collection_name.clone();
                if let Some((db, coll)) = split_namespace(&ns) {
                    if let Err(e) = ctx.store.insert_many(db, coll, req.documents) {
                        tracing::warn!(conn_id = ctx.connection_id, ns = %ns, error = %e, "insert failed");
                    }
                } else {
                    tracing::warn!(conn_id = ctx.connection_id, ns = %ns, "insert with bad namespace");
                }
            }
            Ok(None)
        }
        OpCode::Update => {
            if let Some(req) = decode_write(ctx, op, frame, decode_update)? {
                if let Some((db, coll)) = split_namespace(&req.full_collection_name) {
                    let r = if req.flags & UPDATE_UPSERT != 0 {
                        apply_upsert(ctx.store.as_ref(), db, coll, &req.selector, &req.update)
                    } else if req.flags & UPDATE_MULTI != 0 {
                        ctx.store.update_many(db, coll, &req.selector, &req.update).map(|_| ())
                    } else {
                        ctx.store.update_one(db, coll, &req.selector, &req.update).map(|_| ())
                    };
                    if let Err(e) = r {
                        tracing::warn!(conn_id = ctx.connection_id, ns = %req.full_collection_name, error = %e, "update failed");
                    }
                } else {
                    tracing::warn!(conn_id = ctx.connection_id, ns = %req.full_collection_name, "update with bad namespace");
                }
            }
            Ok(None)
        }
        OpCode::Delete => {
            if let Some(req) = decode_write(ctx, op, frame, decode_delete)? {
                if let Some((db, coll)) = split_namespace(&req.full_collection_name) {
                    let multi = req.flags & 1 != 0;
                    for filter in &req.documents {
                        if let Err(e) = ctx.store.remove(db, coll, filter, multi) {
                            tracing::warn!(conn_id = ctx.connection_id, ns = %req.full_collection_name, error = %e, "delete failed");
                        }
                    }
                } else {
                    tracing::warn!(conn_id = ctx.connection_id, ns = %req.full_collection_name, "delete with bad namespace");
                }
            }
            Ok(None)
        }
        OpCode::GetMore => {
            let _ = decode_write(ctx, op, frame, decode_get_more)?;
            tracing::warn!(conn_id = ctx.connection_id, "OP_GET_MORE is not supported");
            Ok(None)
        }
        OpCode::KillCursors => {
            let _ = decode_write(ctx, op, frame, decode_kill_cursors)?;
            tracing::warn!(conn_id = ctx.connection_id, "OP_KILL_CURSORS is not supported");
            Ok(None)
        }
        OpCode::Compressed => {
            // Never negotiated in hello; the wrapped command is not
            // decodable, so there is nothing to answer.
            if let Err(e) = decode_compressed(frame) {
                tracing::warn!(conn_id = ctx.connection_id, error = %e, "dropping OP_COMPRESSED frame");
            }
            Ok(None)
        }
        OpCode::Reply | OpCode::Dummy => {
            tracing::warn!(
                conn_id = ctx.connection_id,
                op_code = header.op_code,
                "unexpected client op code"
            );
            Ok(None)
        }
    }
}

/// Decode a fire-and-forget opcode body. Malformed documents and bad UTF-8
/// are logged and dropped (there is no reply channel for legacy writes);
/// framing errors stay fatal.
fn decode_write<T>(
    ctx: &DispatchContext,
    op: OpCode,
    frame: &[u8],
    decode: fn(&[u8]) -> Result<T>,
) -> Result<Option<T>> {
    match decode(frame) {
        Ok(req) => Ok(Some(req)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(conn_id = ctx.connection_id, op_code = op as i32, error = %e, "dropping undecodable write");
            Ok(None)
        }
    }
}

fn dispatch_msg(
    ctx: &DispatchContext,
    header: &MessageHeader,
    frame: &[u8],
) -> Result<Option<Vec<u8>>> {
    let msg: MsgRequest = match decode_msg(frame) {
        Ok(msg) => msg,
        Err(Error::CrcMismatch { expected, actual }) => {
            tracing::warn!(
                conn_id = ctx.connection_id,
                expected,
                actual,
                "discarding OP_MSG with bad checksum"
            );
            return Ok(None);
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!(conn_id = ctx.connection_id, error = %e, "undecodable OP_MSG body");
            let reply = error_doc(ERROR_UNKNOWN, &e.to_string());
            return Ok(Some(encode_op_msg_with(
                &reply,
                header.request_id,
                ctx.next_request_id(),
                0,
            )));
        }
    };

    if msg.more_to_come() {
        // The client asked for no reply.
        return Ok(None);
    }

    let reply = match msg.body() {
        Some(cmd) => run_command(cmd, &ctx.command_context()),
        None => error_doc(ERROR_UNKNOWN, "no command document in message"),
    };

    // checksumPresent round-trips; exhaustAllowed is never granted.
    let flags_out = msg.flag_bits & MSG_CHECKSUM_PRESENT;
    Ok(Some(encode_op_msg_with(
        &reply,
        header.request_id,
        ctx.next_request_id(),
        flags_out,
    )))
}

fn dispatch_query(
    ctx: &DispatchContext,
    header: &MessageHeader,
    frame: &[u8],
) -> Result<Option<Vec<u8>>> {
    let req = match decode_query(frame) {
        Ok(req) => req,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!(conn_id = ctx.connection_id, error = %e, "undecodable OP_QUERY body");
            return Ok(Some(encode_op_reply(
                &[],
                REPLY_QUERY_FAILURE,
                header.request_id,
                ctx.next_request_id(),
            )));
        }
    };

    if is_handshake(&req.query) {
        let hello = crate::commands::hello_doc(ctx.info.as_ref(), ctx.connection_id);
        return Ok(Some(encode_op_reply(
            &[hello],
            REPLY_AWAIT_CAPABLE,
            header.request_id,
            ctx.next_request_id(),
        )));
    }

    let (flags, docs) = execute_query(ctx.store.as_ref(), &req);
    Ok(Some(encode_op_reply(
        &docs,
        flags,
        header.request_id,
        ctx.next_request_id(),
    )))
}

fn is_handshake(query: &Document) -> bool {
    match query.get("ismaster") {
        Some(Bson::Int32(n)) => *n == 1,
        Some(Bson::Int64(n)) => *n == 1,
        Some(Bson::Double(d)) => *d == 1.0,
        Some(Bson::Boolean(b)) => *b,
        _ => false,
    }
}

fn apply_upsert(
    store: &dyn DocumentStore,
    db: &str,
    coll: &str,
    selector: &Document,
    update: &Document,
) -> Result<()> {
    let existing = store.find(db, coll, selector, None, 0, Some(1))?;
    if existing.is_empty() {
        store.insert_one(db, coll, update.clone())?;
    }
    Ok(())
}
