//! Static server identity: the environment documents advertised by
//! `hello`, `buildInfo`, and `hostInfo`. Assembled once at startup and
//! shared read-only across connections.

use crate::protocol::{
    MAX_BSON_OBJECT_SIZE, MAX_MESSAGE_SIZE, MAX_WIRE_VERSION, MAX_WRITE_BATCH_SIZE,
    MIN_WIRE_VERSION,
};
use bson::oid::ObjectId;
use bson::{doc, Document};

pub const SERVER_VERSION: &str = "8.0.4";

#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// One ObjectId per process, reused in every topologyVersion.
    pub process_id: ObjectId,
    base: Document,
    build: Document,
    host: Document,
}

impl ServerInfo {
    pub fn new() -> Self {
        Self {
            process_id: ObjectId::new(),
            base: base_env(),
            build: build_info(),
            host: host_info(),
        }
    }

    /// Capability limits common to every hello-shaped reply. `localTime` is
    /// stamped by the handler, not here.
    pub fn base(&self) -> Document {
        self.base.clone()
    }

    pub fn build(&self) -> Document {
        self.build.clone()
    }

    pub fn host(&self) -> Document {
        self.host.clone()
    }
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self::new()
    }
}

fn base_env() -> Document {
    doc! {
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "maxMessageSizeBytes": MAX_MESSAGE_SIZE,
        "maxWriteBatchSize": MAX_WRITE_BATCH_SIZE,
        "logicalSessionTimeoutMinutes": 30i32,
        "minWireVersion": MIN_WIRE_VERSION,
        "maxWireVersion": MAX_WIRE_VERSION,
        "readOnly": false,
    }
}

fn build_info() -> Document {
    doc! {
        "version": SERVER_VERSION,
        "gitVersion": "unreleased",
        "modules": bson::Bson::Array(vec![]),
        "allocator": "system",
        "javascriptEngine": "none",
        "sysInfo": "deprecated",
        "versionArray": [8i32, 0i32, 4i32, 0i32],
        "bits": 64i32,
        "debug": cfg!(debug_assertions),
        "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
        "storageEngines": ["devnull", "memory"],
    }
}

fn host_info() -> Document {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1);
    doc! {
        "system": {
            "currentTime": bson::DateTime::now(),
            "hostname": hostname,
            "cpuAddrSize": 64i32,
            "memSizeMB": 0i64,
            "memLimitMB": 0i64,
            "numCores": cores,
            "numCoresAvailableToProcess": cores,
            "numPhysicalCores": cores,
            "numCpuSockets": 1i32,
            "cpuArch": std::env::consts::ARCH,
            "numaEnabled": false,
            "numNumaNodes": 1i32,
        },
        "os": {
            "type": std::env::consts::OS,
            "name": std::env::consts::OS,
            "version": "unknown",
        },
        "extra": {
            "pageSize": 4096i64,
        },
    }
}
