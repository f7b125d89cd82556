//! Per-opcode body codecs. Every decoder takes one full raw frame (header
//! included) because the documented body layouts start at offset 16.

use crate::error::{Error, Result};
use crate::protocol::wire::{put_cstring, put_document, ByteReader};
use crate::protocol::{MessageHeader, OpCode, HEADER_LEN};
use bson::Document;
use bytes::{BufMut, BytesMut};

// OP_MSG flag bits.
pub const MSG_CHECKSUM_PRESENT: u32 = 1;
pub const MSG_MORE_TO_COME: u32 = 1 << 1;
pub const MSG_EXHAUST_ALLOWED: u32 = 1 << 16;

// OP_REPLY response flag bits.
pub const REPLY_QUERY_FAILURE: i32 = 1 << 1;
pub const REPLY_AWAIT_CAPABLE: i32 = 1 << 3;

// OP_UPDATE / OP_DELETE request flag bits.
pub const UPDATE_UPSERT: i32 = 1;
pub const UPDATE_MULTI: i32 = 1 << 1;
pub const DELETE_SINGLE_REMOVE: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// kind 0: a single body document.
    Body(Document),
    /// kind 1: a size-prefixed, identifier-tagged document sequence.
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgRequest {
    pub flag_bits: u32,
    pub sections: Vec<Section>,
}

impl MsgRequest {
    pub fn checksum_present(&self) -> bool {
        self.flag_bits & MSG_CHECKSUM_PRESENT != 0
    }

    pub fn more_to_come(&self) -> bool {
        self.flag_bits & MSG_MORE_TO_COME != 0
    }

    pub fn exhaust_allowed(&self) -> bool {
        self.flag_bits & MSG_EXHAUST_ALLOWED != 0
    }

    /// The section-0 command document, if the message carries one.
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|s| match s {
            Section::Body(doc) => Some(doc),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertRequest {
    pub flags: i32,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
    pub update: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub full_collection_name: String,
    pub flags: i32,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreRequest {
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsRequest {
    pub cursor_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyResponse {
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

pub fn decode_query(frame: &[u8]) -> Result<QueryRequest> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let flags = r.read_i32()?;
    let full_collection_name = r.read_cstring()?;
    let number_to_skip = r.read_i32()?;
    let number_to_return = r.read_i32()?;
    let query = r.read_document()?;
    // Present iff body bytes remain
    let return_fields_selector = if r.is_empty() {
        None
    } else {
        Some(r.read_document()?)
    };
    if !r.is_empty() {
        return Err(Error::TrailingGarbage(r.remaining()));
    }
    Ok(QueryRequest {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
        return_fields_selector,
    })
}

pub fn decode_insert(frame: &[u8]) -> Result<InsertRequest> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let flags = r.read_i32()?;
    let full_collection_name = r.read_cstring()?;
    let documents = read_documents_to_end(&mut r)?;
    if documents.is_empty() {
        return Err(Error::MalformedDocument("insert carries no documents".into()));
    }
    Ok(InsertRequest {
        flags,
        full_collection_name,
        documents,
    })
}

pub fn decode_update(frame: &[u8]) -> Result<UpdateRequest> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let _zero = r.read_i32()?;
    let full_collection_name = r.read_cstring()?;
    let flags = r.read_i32()?;
    let selector = r.read_document()?;
    let update = r.read_document()?;
    if !r.is_empty() {
        return Err(Error::TrailingGarbage(r.remaining()));
    }
    Ok(UpdateRequest {
        full_collection_name,
        flags,
        selector,
        update,
    })
}

pub fn decode_delete(frame: &[u8]) -> Result<DeleteRequest> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let _zero = r.read_i32()?;
    let full_collection_name = r.read_cstring()?;
    let flags = r.read_i32()?;
    let documents = read_documents_to_end(&mut r)?;
    Ok(DeleteRequest {
        full_collection_name,
        flags,
        documents,
    })
}

pub fn decode_get_more(frame: &[u8]) -> Result<GetMoreRequest> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let _zero = r.read_i32()?;
    let full_collection_name = r.read_cstring()?;
    let number_to_return = r.read_i32()?;
    let cursor_id = r.read_i64()?;
    if !r.is_empty() {
        return Err(Error::TrailingGarbage(r.remaining()));
    }
    Ok(GetMoreRequest {
        full_collection_name,
        number_to_return,
        cursor_id,
    })
}

pub fn decode_kill_cursors(frame: &[u8]) -> Result<KillCursorsRequest> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let _zero = r.read_i32()?;
    let n = r.read_i32()?;
    let mut cursor_ids = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        cursor_ids.push(r.read_i64()?);
    }
    if !r.is_empty() {
        return Err(Error::TrailingGarbage(r.remaining()));
    }
    Ok(KillCursorsRequest { cursor_ids })
}

pub fn decode_reply(frame: &[u8]) -> Result<ReplyResponse> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let response_flags = r.read_i32()?;
    let cursor_id = r.read_i64()?;
    let starting_from = r.read_i32()?;
    let number_returned = r.read_i32()?;
    let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
    for _ in 0..number_returned {
        documents.push(r.read_document()?);
    }
    if !r.is_empty() {
        return Err(Error::TrailingGarbage(r.remaining()));
    }
    Ok(ReplyResponse {
        response_flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    })
}

/// Acknowledged opcode; decompression is not implemented and the wrapped
/// command is never recovered.
pub fn decode_compressed(_frame: &[u8]) -> Result<MsgRequest> {
    Err(Error::Unsupported("OP_COMPRESSED"))
}

/// Decode an OP_MSG frame. When flag bit 0 is set the trailing 4 bytes are a
/// CRC-32C over the rest of the frame and are verified before any section is
/// parsed.
pub fn decode_msg(frame: &[u8]) -> Result<MsgRequest> {
    let mut r = ByteReader::starting_at(frame, HEADER_LEN);
    let flag_bits = r.read_u32()?;

    let mut body_end = frame.len();
    if flag_bits & MSG_CHECKSUM_PRESENT != 0 {
        if frame.len() < HEADER_LEN + 4 + 4 {
            return Err(Error::TruncatedFrame {
                offset: frame.len(),
                needed: 4,
            });
        }
        body_end = frame.len() - 4;
        let expected = u32::from_le_bytes(frame[body_end..].try_into().unwrap());
        let actual = crc32c::crc32c(&frame[..body_end]);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }
    }

    // Clamp the cursor to the section area so a document can never read into
    // the checksum trailer.
    let mut r = ByteReader::starting_at(&frame[..body_end], r.pos());
    let mut sections = Vec::new();
    while !r.is_empty() {
        if let Some(section) = read_section(&mut r)? {
            sections.push(section);
        }
    }
    Ok(MsgRequest {
        flag_bits,
        sections,
    })
}

/// One kind-tagged OP_MSG section. Kind 2 is reserved for internal use and
/// skipped by its size prefix without surfacing; unknown kinds are logged and
/// skipped the same way.
fn read_section(r: &mut ByteReader<'_>) -> Result<Option<Section>> {
    let kind = r.read_u8()?;
    match kind {
        0 => Ok(Some(Section::Body(r.read_document()?))),
        1 => {
            let size_pos = r.pos();
            let size = r.read_i32()?;
            if size < 5 {
                return Err(Error::MalformedDocument(format!(
                    "section size {} below minimum",
                    size
                )));
            }
            let section_end = size_pos + size as usize;
            let identifier = r.read_cstring()?;
            let mut documents = Vec::new();
            while r.pos() < section_end {
                documents.push(r.read_document()?);
            }
            if r.pos() != section_end {
                return Err(Error::MalformedDocument(
                    "document sequence overruns its section size".into(),
                ));
            }
            Ok(Some(Section::Sequence {
                identifier,
                documents,
            }))
        }
        other => {
            if other != 2 {
                tracing::warn!(kind = other, "skipping section of unknown kind");
            }
            let size = r.read_i32()?;
            if size < 4 {
                return Err(Error::MalformedDocument(format!(
                    "section size {} below minimum",
                    size
                )));
            }
            r.skip(size as usize - 4)?;
            Ok(None)
        }
    }
}

fn read_documents_to_end(r: &mut ByteReader<'_>) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    while !r.is_empty() {
        // Anything too short to even hold a length prefix is stray bytes,
        // not a further document.
        if r.remaining() < 5 {
            return Err(Error::TrailingGarbage(r.remaining()));
        }
        documents.push(r.read_document()?);
    }
    Ok(documents)
}

fn finish_frame(mut out: Vec<u8>, request_id: i32, response_to: i32, op: OpCode) -> Vec<u8> {
    let header = MessageHeader {
        message_length: (HEADER_LEN + out.len()) as i32,
        request_id,
        response_to,
        op_code: op as i32,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + out.len());
    header.encode(&mut frame);
    frame.append(&mut out);
    frame
}

/// Encode an OP_MSG with section 0 containing a single BSON document.
/// Returns a Vec with the full wire message including the message header.
pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Vec<u8> {
    encode_op_msg_with(doc, response_to, request_id, 0)
}

/// OP_MSG encoder with explicit flag bits. When bit 0 (checksumPresent) is
/// set, a CRC-32C over the whole frame minus the trailer is appended and
/// accounted for in `message_length`.
pub fn encode_op_msg_with(
    doc: &Document,
    response_to: i32,
    request_id: i32,
    flag_bits: u32,
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32_le(flag_bits);
    body.put_u8(0); // section kind 0
    put_document(&mut body, doc).expect("bson encode");

    let with_checksum = flag_bits & MSG_CHECKSUM_PRESENT != 0;
    let trailer = if with_checksum { 4 } else { 0 };
    let header = MessageHeader {
        message_length: (HEADER_LEN + body.len() + trailer) as i32,
        request_id,
        response_to,
        op_code: OpCode::Msg as i32,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len() + trailer);
    header.encode(&mut frame);
    frame.extend_from_slice(&body);
    if with_checksum {
        let crc = crc32c::crc32c(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
    }
    frame
}

/// Encode an OP_REPLY with the provided documents.
pub fn encode_op_reply(
    docs: &[Document],
    response_flags: i32,
    response_to: i32,
    request_id: i32,
) -> Vec<u8> {
    let cursor_id: i64 = 0; // results always fit one batch
    let starting_from: i32 = 0;

    let mut body = BytesMut::new();
    body.put_i32_le(response_flags);
    body.put_i64_le(cursor_id);
    body.put_i32_le(starting_from);
    body.put_i32_le(docs.len() as i32);
    for d in docs {
        put_document(&mut body, d).expect("bson encode");
    }
    finish_frame(body.to_vec(), request_id, response_to, OpCode::Reply)
}

pub fn encode_op_query(
    flags: i32,
    full_collection_name: &str,
    number_to_skip: i32,
    number_to_return: i32,
    query: &Document,
    return_fields_selector: Option<&Document>,
    request_id: i32,
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32_le(flags);
    put_cstring(&mut body, full_collection_name);
    body.put_i32_le(number_to_skip);
    body.put_i32_le(number_to_return);
    put_document(&mut body, query).expect("bson encode");
    if let Some(sel) = return_fields_selector {
        put_document(&mut body, sel).expect("bson encode");
    }
    finish_frame(body.to_vec(), request_id, 0, OpCode::Query)
}

pub fn encode_op_insert(
    flags: i32,
    full_collection_name: &str,
    docs: &[Document],
    request_id: i32,
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32_le(flags);
    put_cstring(&mut body, full_collection_name);
    for d in docs {
        put_document(&mut body, d).expect("bson encode");
    }
    finish_frame(body.to_vec(), request_id, 0, OpCode::Insert)
}

pub fn encode_op_update(
    full_collection_name: &str,
    flags: i32,
    selector: &Document,
    update: &Document,
    request_id: i32,
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32_le(0); // reserved
    put_cstring(&mut body, full_collection_name);
    body.put_i32_le(flags);
    put_document(&mut body, selector).expect("bson encode");
    put_document(&mut body, update).expect("bson encode");
    finish_frame(body.to_vec(), request_id, 0, OpCode::Update)
}

pub fn encode_op_delete(
    full_collection_name: &str,
    flags: i32,
    docs: &[Document],
    request_id: i32,
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32_le(0); // reserved
    put_cstring(&mut body, full_collection_name);
    body.put_i32_le(flags);
    for d in docs {
        put_document(&mut body, d).expect("bson encode");
    }
    finish_frame(body.to_vec(), request_id, 0, OpCode::Delete)
}

pub fn encode_op_get_more(
    full_collection_name: &str,
    number_to_return: i32,
    cursor_id: i64,
    request_id: i32,
) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32_le(0); // reserved
    put_cstring(&mut body, full_collection_name);
    body.put_i32_le(number_to_return);
    body.put_i64_le(cursor_id);
    finish_frame(body.to_vec(), request_id, 0, OpCode::GetMore)
}

pub fn encode_op_kill_cursors(cursor_ids: &[i64], request_id: i32) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i32_le(0); // reserved
    body.put_i32_le(cursor_ids.len() as i32);
    for id in cursor_ids {
        body.put_i64_le(*id);
    }
    finish_frame(body.to_vec(), request_id, 0, OpCode::KillCursors)
}

/// Decode OP_MSG section-0 document from the provided body bytes (header
/// already stripped). Returns the flag bits and the parsed document.
pub fn decode_op_msg_section0(body: &[u8]) -> Option<(u32, Document)> {
    if body.len() < 5 {
        return None;
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if body[4] != 0u8 {
        return None; // only a leading body section
    }
    let mut doc_bytes = &body[5..];
    if flags & MSG_CHECKSUM_PRESENT != 0 {
        if doc_bytes.len() < 4 {
            return None;
        }
        doc_bytes = &doc_bytes[..doc_bytes.len() - 4];
    }
    Document::from_reader(&mut std::io::Cursor::new(doc_bytes)).ok().map(|doc| (flags, doc))
}
