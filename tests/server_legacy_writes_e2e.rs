use bson::doc;
use minimongo::config::Config;
use minimongo::protocol::message::{
    encode_op_delete, encode_op_get_more, encode_op_insert, encode_op_kill_cursors,
    encode_op_msg, encode_op_query, encode_op_update, UPDATE_MULTI,
};
use minimongo::server::spawn_with_shutdown;
use std::time::Duration;
use tokio::net::TcpStream;

#[path = "common/client.rs"]
mod client;

fn test_config() -> Config {
    Config::default().with_overrides(Some("127.0.0.1:0".to_string()), None)
}

#[tokio::test]
async fn e2e_insert_then_query() {
    let (_state, addr, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // fire-and-forget insert, then a query on the same connection; in-order
    // dispatch guarantees the query sees both documents
    client::send(
        &mut stream,
        &encode_op_insert(0, "test.users", &[doc! { "name": "a" }, doc! { "name": "b" }], 1),
    )
    .await;
    client::send(
        &mut stream,
        &encode_op_query(0, "test.users", 0, 10, &doc! {}, None, 2),
    )
    .await;

    let (hdr, reply) = client::read_one_op_reply(&mut stream).await;
    assert_eq!(hdr.response_to, 2);
    assert_eq!(reply.response_flags, 0);
    assert_eq!(reply.cursor_id, 0);
    assert_eq!(reply.number_returned, 2);
    let names: Vec<&str> = reply
        .documents
        .iter()
        .map(|d| d.get_str("name").unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);

    let _ = shutdown.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn e2e_query_with_orderby_and_skip() {
    let (_state, addr, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let docs = [doc! { "n": 2i32 }, doc! { "n": 3i32 }, doc! { "n": 1i32 }];
    client::send(&mut stream, &encode_op_insert(0, "test.nums", &docs, 1)).await;
    client::send(
        &mut stream,
        &encode_op_query(
            0,
            "test.nums",
            1,
            10,
            &doc! { "$query": {}, "$orderby": { "n": 1i32 } },
            None,
            2,
        ),
    )
    .await;

    let (_, reply) = client::read_one_op_reply(&mut stream).await;
    let ns: Vec<i32> = reply.documents.iter().map(|d| d.get_i32("n").unwrap()).collect();
    assert_eq!(ns, vec![2, 3]);

    let _ = shutdown.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn e2e_update_and_delete() {
    let (_state, addr, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    client::send(
        &mut stream,
        &encode_op_insert(
            0,
            "test.users",
            &[doc! { "name": "a", "age": 1i32 }, doc! { "name": "a", "age": 2i32 }],
            1,
        ),
    )
    .await;

    // multi-update every "a" document
    client::send(
        &mut stream,
        &encode_op_update(
            "test.users",
            UPDATE_MULTI,
            &doc! { "name": "a" },
            &doc! { "$set": { "seen": true } },
            2,
        ),
    )
    .await;
    client::send(
        &mut stream,
        &encode_op_query(0, "test.users", 0, 10, &doc! { "seen": true }, None, 3),
    )
    .await;
    let (_, reply) = client::read_one_op_reply(&mut stream).await;
    assert_eq!(reply.number_returned, 2);

    // single delete removes one of the two
    client::send(
        &mut stream,
        &encode_op_delete("test.users", 0, &[doc! { "name": "a" }], 4),
    )
    .await;
    client::send(
        &mut stream,
        &encode_op_query(0, "test.users", 0, 10, &doc! {}, None, 5),
    )
    .await;
    let (_, reply) = client::read_one_op_reply(&mut stream).await;
    assert_eq!(reply.number_returned, 1);

    let _ = shutdown.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn e2e_unsupported_cursor_ops_stay_silent_and_keep_connection() {
    let (_state, addr, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    client::send(&mut stream, &encode_op_get_more("test.users", 10, 1234, 1)).await;
    client::send(&mut stream, &encode_op_kill_cursors(&[1234], 2)).await;
    client::assert_no_frame(&mut stream, Duration::from_millis(200)).await;

    // the connection is still healthy afterwards
    client::send(&mut stream, &encode_op_msg(&doc! { "ping": 1i32, "$db": "admin" }, 0, 3)).await;
    let (_, _, doc) = client::read_one_op_msg(&mut stream).await;
    assert_eq!(doc, doc! { "ok": 1.0 });

    let _ = shutdown.send(true);
    let _ = handle.await;
}
