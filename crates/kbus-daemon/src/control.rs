//! Control surface.
//!
//! Every operation a transport can perform on behalf of a caller is one
//! [`ControlRequest`] variant; [`dispatch`] applies it to the
//! [`BusService`] and always produces a [`ControlResponse`]. Frames are JSON
//! objects tagged by `op` (requests) or `status` (responses). Binary fields
//! (encoded messages, payloads, memfd contents) travel as lowercase hex.
//!
//! ```json
//! {"op":"name_acquire","bus":"system","conn":3,"name":"org.example","flags":"QUEUE"}
//! {"status":"acquired","result":"queued"}
//! ```

use kbus_core::{
    AcquireStatus, AttachFlags, BusConfig, BusError, ConnFlags, ConnectionInfo, Credentials,
    Envelope, Hello, HelloReply, Item, ListFlags, MakeFlags, MatchRule, NameFlags,
    NameListEntry, NameQuery, PolicyAccess, ProcessMetadata, Received,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::DaemonError;
use crate::service::BusService;

// ============================================================================
// Requests
// ============================================================================

/// A control operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Creates a bus owned by `owner`.
    CreateBus {
        /// Bus parameters.
        config: BusConfig,
        /// Creator credentials.
        owner: Credentials,
    },
    /// Adds an endpoint to a bus.
    CreateEndpoint {
        /// Target bus.
        bus: String,
        /// Credentials of the caller.
        caller: Credentials,
        /// Endpoint name.
        name: String,
        /// Who may connect.
        #[serde(default)]
        flags: MakeFlags,
    },
    /// Registers a connection.
    Hello {
        /// Target bus.
        bus: String,
        /// Endpoint to connect through.
        #[serde(default = "default_endpoint")]
        endpoint: String,
        /// Metadata of the connecting process.
        metadata: ProcessMetadata,
        /// Connection flags.
        #[serde(default)]
        conn_flags: ConnFlags,
        /// Metadata the connection wants attached.
        #[serde(default)]
        attach_flags: AttachFlags,
        /// Name to activate, with `STARTER`.
        #[serde(default)]
        starter_name: Option<String>,
    },
    /// Tears a connection down.
    Bye {
        /// Target bus.
        bus: String,
        /// Connection id.
        conn: u64,
    },
    /// Sends an encoded message.
    Send {
        /// Target bus.
        bus: String,
        /// Sending connection.
        conn: u64,
        /// Hex-encoded message.
        message: String,
    },
    /// Dequeues the next message.
    Receive {
        /// Target bus.
        bus: String,
        /// Receiving connection.
        conn: u64,
    },
    /// Reads a received message.
    ReadMessage {
        /// Target bus.
        bus: String,
        /// Receiving connection.
        conn: u64,
        /// Offset returned by `receive`.
        offset: u64,
    },
    /// Reads a received message's payload.
    ReadPayload {
        /// Target bus.
        bus: String,
        /// Receiving connection.
        conn: u64,
        /// Offset returned by `receive`.
        offset: u64,
    },
    /// Releases a received pool slice.
    Free {
        /// Target bus.
        bus: String,
        /// Receiving connection.
        conn: u64,
        /// Offset returned by `receive`.
        offset: u64,
    },
    /// Acquires a well-known name.
    NameAcquire {
        /// Target bus.
        bus: String,
        /// Claiming connection.
        conn: u64,
        /// The name.
        name: String,
        /// Acquire flags.
        #[serde(default)]
        flags: NameFlags,
    },
    /// Releases a name.
    NameRelease {
        /// Target bus.
        bus: String,
        /// Owning or queued connection.
        conn: u64,
        /// The name.
        name: String,
    },
    /// Lists names and connections.
    NameList {
        /// Target bus.
        bus: String,
        /// What to list.
        flags: ListFlags,
    },
    /// Describes a connection.
    NameInfo {
        /// Target bus.
        bus: String,
        /// Id or name to look up.
        query: NameQuery,
    },
    /// Installs a match rule.
    MatchAdd {
        /// Target bus.
        bus: String,
        /// Owning connection.
        conn: u64,
        /// The rule.
        rule: MatchRule,
    },
    /// Removes match rules by cookie.
    MatchRemove {
        /// Target bus.
        bus: String,
        /// Owning connection.
        conn: u64,
        /// Rule cookie.
        cookie: u64,
    },
    /// Switches monitor mode.
    MonitorEnable {
        /// Target bus.
        bus: String,
        /// Requesting connection.
        conn: u64,
        /// Connection to switch.
        target: u64,
        /// New mode.
        enabled: bool,
    },
    /// Replaces the policy of a name.
    PolicySet {
        /// Target bus.
        bus: String,
        /// Requesting connection.
        conn: u64,
        /// The name.
        name: String,
        /// New entries; empty removes the policy.
        entries: Vec<PolicyAccess>,
    },
    /// Creates a memfd.
    MemfdNew {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Initial size.
        #[serde(default)]
        size: u64,
    },
    /// Reads a memfd's size.
    MemfdSizeGet {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Memfd handle.
        handle: u32,
    },
    /// Resizes a memfd.
    MemfdSizeSet {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Memfd handle.
        handle: u32,
        /// New size.
        size: u64,
    },
    /// Reads a memfd's seal state.
    MemfdSealGet {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Memfd handle.
        handle: u32,
    },
    /// Seals a memfd.
    MemfdSealSet {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Memfd handle.
        handle: u32,
    },
    /// Writes into a memfd.
    MemfdWrite {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Memfd handle.
        handle: u32,
        /// Byte offset.
        #[serde(default)]
        offset: u64,
        /// Hex-encoded bytes.
        data: String,
    },
    /// Reads a memfd's contents.
    MemfdRead {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Memfd handle.
        handle: u32,
    },
    /// Drops a memfd reference.
    MemfdClose {
        /// Target bus.
        bus: String,
        /// Holding connection.
        conn: u64,
        /// Memfd handle.
        handle: u32,
    },
}

fn default_endpoint() -> String {
    kbus_core::DEFAULT_ENDPOINT.to_string()
}

// ============================================================================
// Responses
// ============================================================================

/// Result of a control operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Success without a value.
    Ok,
    /// Hello accepted.
    Hello(HelloReply),
    /// A message was dequeued.
    Received(Received),
    /// Nothing is queued.
    Empty,
    /// A hex-encoded message.
    Message {
        /// Encoded message as the receiver's pool holds it.
        message: String,
    },
    /// Hex-encoded bytes.
    Data {
        /// The bytes.
        data: String,
    },
    /// Name acquire result.
    Acquired {
        /// Owned or queued.
        result: AcquireStatus,
    },
    /// Name listing.
    Names {
        /// Listed entries.
        entries: Vec<NameListEntry>,
    },
    /// Connection description.
    Info(ConnectionInfo),
    /// Match rules removed.
    Removed {
        /// How many rules shared the cookie.
        count: usize,
    },
    /// A new memfd.
    Memfd {
        /// Its handle.
        handle: u32,
    },
    /// A memfd size.
    Size {
        /// Size in bytes.
        size: u64,
    },
    /// A memfd seal state.
    Sealed {
        /// `true` once sealed.
        sealed: bool,
    },
    /// The operation failed.
    Error {
        /// Stable error identifier.
        code: String,
        /// Human-readable description.
        message: String,
    },
}

impl ControlResponse {
    fn from_error(err: &DaemonError) -> Self {
        let code = match err {
            DaemonError::Bus(bus) => bus.code(),
            DaemonError::Config(_) => "invalid_config",
            DaemonError::UnknownBus { .. } => "unknown_bus",
            DaemonError::BusExists { .. } => "bus_exists",
            DaemonError::Frame(_) => "invalid_frame",
        };
        Self::Error {
            code: code.to_string(),
            message: err.to_string(),
        }
    }

    /// Returns `true` unless this is an error.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Applies `request` to `service`.
pub fn dispatch(service: &BusService, request: ControlRequest) -> ControlResponse {
    match apply(service, request) {
        Ok(response) => response,
        Err(err) => {
            if matches!(&err, DaemonError::Bus(bus) if bus.is_caller_fault()) {
                debug!(error = %err, "control request rejected");
            }
            ControlResponse::from_error(&err)
        },
    }
}

/// Decodes a JSON request frame, dispatches it and encodes the response.
#[must_use]
pub fn handle_frame(service: &BusService, frame: &str) -> String {
    let response = match serde_json::from_str::<ControlRequest>(frame) {
        Ok(request) => dispatch(service, request),
        Err(err) => ControlResponse::from_error(&DaemonError::Frame(err)),
    };
    serde_json::to_string(&response).unwrap_or_else(|err| {
        warn!(error = %err, "control response not encodable");
        r#"{"status":"error","code":"invalid_frame","message":"response not encodable"}"#
            .to_string()
    })
}

fn decode_hex(field: &str, text: &str) -> Result<Vec<u8>, DaemonError> {
    hex::decode(text)
        .map_err(|err| BusError::invalid_argument(format!("{field} is not hex: {err}")).into())
}

fn apply(service: &BusService, request: ControlRequest) -> Result<ControlResponse, DaemonError> {
    use ControlRequest as R;

    let response = match request {
        R::CreateBus { config, owner } => {
            service.create_bus(config, owner)?;
            ControlResponse::Ok
        },
        R::CreateEndpoint {
            bus,
            caller,
            name,
            flags,
        } => {
            service.bus(&bus)?.create_endpoint(caller, &name, flags)?;
            ControlResponse::Ok
        },
        R::Hello {
            bus,
            endpoint,
            metadata,
            conn_flags,
            attach_flags,
            starter_name,
        } => {
            let hello = Hello {
                conn_flags,
                attach_flags,
                items: starter_name.into_iter().map(Item::StarterName).collect(),
            };
            ControlResponse::Hello(service.bus(&bus)?.hello(&endpoint, metadata, hello)?)
        },
        R::Bye { bus, conn } => {
            service.bus(&bus)?.disconnect(conn)?;
            ControlResponse::Ok
        },
        R::Send { bus, conn, message } => {
            let wire = decode_hex("message", &message)?;
            service.bus(&bus)?.send_raw(conn, &wire)?;
            ControlResponse::Ok
        },
        R::Receive { bus, conn } => match service.bus(&bus)?.receive(conn)? {
            Some(received) => ControlResponse::Received(received),
            None => ControlResponse::Empty,
        },
        R::ReadMessage { bus, conn, offset } => {
            let msg = match service.bus(&bus)?.read_message(conn, offset)? {
                Envelope::User(msg) => msg,
                Envelope::Kernel(note) => note.into_message(conn),
            };
            ControlResponse::Message {
                message: hex::encode(msg.encode()),
            }
        },
        R::ReadPayload { bus, conn, offset } => ControlResponse::Data {
            data: hex::encode(service.bus(&bus)?.read_payload(conn, offset)?),
        },
        R::Free { bus, conn, offset } => {
            service.bus(&bus)?.free(conn, offset)?;
            ControlResponse::Ok
        },
        R::NameAcquire {
            bus,
            conn,
            name,
            flags,
        } => ControlResponse::Acquired {
            result: service.bus(&bus)?.name_acquire(conn, &name, flags)?,
        },
        R::NameRelease { bus, conn, name } => {
            service.bus(&bus)?.name_release(conn, &name)?;
            ControlResponse::Ok
        },
        R::NameList { bus, flags } => ControlResponse::Names {
            entries: service.bus(&bus)?.name_list(flags),
        },
        R::NameInfo { bus, query } => ControlResponse::Info(service.bus(&bus)?.info(&query)?),
        R::MatchAdd { bus, conn, rule } => {
            service.bus(&bus)?.match_add(conn, rule)?;
            ControlResponse::Ok
        },
        R::MatchRemove { bus, conn, cookie } => ControlResponse::Removed {
            count: service.bus(&bus)?.match_remove(conn, cookie)?,
        },
        R::MonitorEnable {
            bus,
            conn,
            target,
            enabled,
        } => {
            service.bus(&bus)?.monitor_enable(conn, target, enabled)?;
            ControlResponse::Ok
        },
        R::PolicySet {
            bus,
            conn,
            name,
            entries,
        } => {
            service.bus(&bus)?.policy_set(conn, &name, entries)?;
            ControlResponse::Ok
        },
        R::MemfdNew { bus, conn, size } => ControlResponse::Memfd {
            handle: service.bus(&bus)?.memfd_new(conn, size)?,
        },
        R::MemfdSizeGet { bus, conn, handle } => ControlResponse::Size {
            size: service.bus(&bus)?.memfd_size_get(conn, handle)?,
        },
        R::MemfdSizeSet {
            bus,
            conn,
            handle,
            size,
        } => {
            service.bus(&bus)?.memfd_size_set(conn, handle, size)?;
            ControlResponse::Ok
        },
        R::MemfdSealGet { bus, conn, handle } => ControlResponse::Sealed {
            sealed: service.bus(&bus)?.memfd_seal_get(conn, handle)?,
        },
        R::MemfdSealSet { bus, conn, handle } => {
            service.bus(&bus)?.memfd_seal_set(conn, handle)?;
            ControlResponse::Ok
        },
        R::MemfdWrite {
            bus,
            conn,
            handle,
            offset,
            data,
        } => {
            let bytes = decode_hex("data", &data)?;
            service
                .bus(&bus)?
                .memfd_write(conn, handle, offset, &bytes)?;
            ControlResponse::Ok
        },
        R::MemfdRead { bus, conn, handle } => ControlResponse::Data {
            data: hex::encode(service.bus(&bus)?.memfd_read(conn, handle)?),
        },
        R::MemfdClose { bus, conn, handle } => {
            service.bus(&bus)?.memfd_close(conn, handle)?;
            ControlResponse::Ok
        },
    };
    Ok(response)
}

/// Serves newline-delimited JSON frames until `reader` reaches end of input
/// or shutdown is requested.
///
/// Blank lines are skipped. Each request line gets exactly one response line.
///
/// # Errors
///
/// Returns I/O errors from either side of the stream.
pub async fn serve_lines<R, W>(
    service: &BusService,
    reader: R,
    mut writer: W,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut served = 0;
    while let Some(line) = lines.next_line().await? {
        if service.is_shutdown_requested() {
            break;
        }
        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }
        let mut reply = handle_frame(service, frame);
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
        served += 1;
    }
    debug!(served, "control stream closed");
    Ok(served)
}
