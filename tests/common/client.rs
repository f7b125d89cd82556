#![allow(dead_code)]

// Raw wire-protocol client helpers shared by the e2e tests.

use minimongo::protocol::message::{decode_op_msg_section0, decode_reply, ReplyResponse};
use minimongo::protocol::{MessageHeader, OpCode, HEADER_LEN};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub async fn send(stream: &mut TcpStream, frame: &[u8]) {
    stream.write_all(frame).await.unwrap();
    stream.flush().await.unwrap();
}

pub async fn read_raw_frame(stream: &mut TcpStream) -> (MessageHeader, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let (hdr, _) = MessageHeader::parse(&header).unwrap();
    let mut frame = vec![0u8; hdr.message_length as usize];
    frame[..HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut frame[HEADER_LEN..]).await.unwrap();
    (hdr, frame)
}

pub async fn read_one_op_msg(stream: &mut TcpStream) -> (MessageHeader, u32, bson::Document) {
    let (hdr, frame) = read_raw_frame(stream).await;
    assert_eq!(hdr.op_code, OpCode::Msg as i32);
    let (flags, doc) = decode_op_msg_section0(&frame[HEADER_LEN..]).unwrap();
    (hdr, flags, doc)
}

pub async fn read_one_op_reply(stream: &mut TcpStream) -> (MessageHeader, ReplyResponse) {
    let (hdr, frame) = read_raw_frame(stream).await;
    assert_eq!(hdr.op_code, OpCode::Reply as i32);
    (hdr, decode_reply(&frame).unwrap())
}

/// Expect silence: no frame arrives within the window.
pub async fn assert_no_frame(stream: &mut TcpStream, window: Duration) {
    let mut byte = [0u8; 1];
    match tokio::time::timeout(window, stream.read(&mut byte)).await {
        Err(_) => {}
        Ok(Ok(0)) => panic!("server closed the connection instead of staying silent"),
        Ok(res) => panic!("expected no frame, got read result {:?}", res),
    }
}
