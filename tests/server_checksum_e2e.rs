use bson::doc;
use minimongo::config::Config;
use minimongo::protocol::message::{encode_op_msg, encode_op_msg_with, MSG_CHECKSUM_PRESENT};
use minimongo::server::spawn_with_shutdown;
use std::time::Duration;
use tokio::net::TcpStream;

#[path = "common/client.rs"]
mod client;

fn test_config() -> Config {
    Config::default().with_overrides(Some("127.0.0.1:0".to_string()), None)
}

#[tokio::test]
async fn e2e_checksummed_ping_round_trips_crc() {
    let (_state, addr, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = encode_op_msg_with(
        &doc! { "ping": 1i32, "$db": "admin" },
        0,
        9,
        MSG_CHECKSUM_PRESENT,
    );
    client::send(&mut stream, &request).await;

    let (hdr, frame) = client::read_raw_frame(&mut stream).await;
    assert_eq!(hdr.response_to, 9);

    // bit 0 reflected, trailer is the CRC-32C of the frame minus the trailer
    let flags = u32::from_le_bytes(frame[16..20].try_into().unwrap());
    assert_eq!(flags & MSG_CHECKSUM_PRESENT, 1);
    let trailer = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
    assert_eq!(trailer, crc32c::crc32c(&frame[..frame.len() - 4]));

    let _ = shutdown.send(true);
    let _ = handle.await;
}

#[tokio::test]
async fn e2e_corrupted_checksum_gets_no_response() {
    let (_state, addr, shutdown, handle) = spawn_with_shutdown(test_config()).await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = encode_op_msg_with(
        &doc! { "ping": 1i32, "$db": "admin" },
        0,
        10,
        MSG_CHECKSUM_PRESENT,
    );
    let last = request.len() - 1;
    request[last] ^= 0xff;
    client::send(&mut stream, &request).await;
    client::assert_no_frame(&mut stream, Duration::from_millis(300)).await;

    // the drop is per-frame, not fatal: a plain ping still answers
    client::send(&mut stream, &encode_op_msg(&doc! { "ping": 1i32, "$db": "admin" }, 0, 11)).await;
    let (hdr, _, doc) = client::read_one_op_msg(&mut stream).await;
    assert_eq!(hdr.response_to, 11);
    assert_eq!(doc, doc! { "ok": 1.0 });

    let _ = shutdown.send(true);
    let _ = handle.await;
}
