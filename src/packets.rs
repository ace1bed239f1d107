//! Hub wire protocol packets and codec.
//!
//! Every message on the hub channel is a MessagePack-encoded envelope: an
//! array whose first element is an integer packet type, followed by that
//! type's fields in declaration order.
//!
//! ```text
//! (type_id: int, field1, field2, ...)
//! ```
//!
//! Decoding is forward-compatible by construction: envelopes with an unknown
//! type id decode to a no-op (`None`) rather than an error, and extra
//! trailing fields are silently dropped. Missing or mistyped required fields
//! fail decode with a typed [`PacketError`].
//!
//! | id | name | sender |
//! |----|------|--------|
//! | 1  | Ping | both |
//! | 2  | Pong | both |
//! | 3  | Log | both |
//! | 4  | Info | server |
//! | 5  | DeclareApps | client |
//! | 6  | SessionOpen | server |
//! | 7  | SessionClose | server |
//! | 8  | SessionData | both |
//! | 9  | RoutePing | server |
//! | 10 | RoutePong | both |
//! | 11 | NotifyTerminalSize | server |
//! | 12 | Focus | both |
//! | 13 | Blur | both |
//! | 14 | OpenUrl | client |
//! | 15 | BinaryEncodedMessage | client |
//! | 16 | DeliverFileStart | client |
//! | 17 | RequestDeliverChunk | server |

use std::fmt;

use rmpv::Value;

use crate::config::App;

/// Errors raised by the packet codec.
#[derive(Debug)]
pub enum PacketError {
    /// The envelope contained no fields at all.
    Empty,
    /// The first envelope field was not an integer.
    TypeIdNotInt,
    /// A field's runtime type did not match the packet schema.
    TypeMismatch {
        /// Packet name.
        packet: &'static str,
        /// Field name.
        field: &'static str,
        /// Expected runtime type.
        expected: &'static str,
    },
    /// The envelope was not a valid MessagePack array.
    Envelope(String),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "packet data is empty"),
            Self::TypeIdNotInt => write!(f, "packet id expected int"),
            Self::TypeMismatch {
                packet,
                field,
                expected,
            } => write!(
                f,
                "{packet}: type of {field:?} incorrect; expected {expected}"
            ),
            Self::Envelope(message) => write!(f, "malformed packet envelope: {message}"),
        }
    }
}

impl std::error::Error for PacketError {}

/// An app as declared to the hub: the presentational subset of [`App`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppAnnouncement {
    /// Human-readable name.
    pub name: String,
    /// URL token.
    pub slug: String,
    /// Presentational color.
    pub color: String,
    /// Whether the app is hosted under a PTY.
    pub terminal: bool,
}

impl AppAnnouncement {
    /// Build an announcement from a configured app.
    #[must_use]
    pub fn from_app(app: &App) -> Self {
        Self {
            name: app.name.clone(),
            slug: app.slug.clone(),
            color: app.color.clone(),
            terminal: app.terminal,
        }
    }

    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::from("name"), Value::from(self.name.as_str())),
            (Value::from("slug"), Value::from(self.slug.as_str())),
            (Value::from("color"), Value::from(self.color.as_str())),
            (Value::from("terminal"), Value::from(self.terminal)),
        ])
    }

    /// Entries are read leniently: absent or mistyped fields fall back to
    /// defaults, matching the schema's list-level (not entry-level) typing.
    fn from_value(value: &Value) -> Self {
        let mut announcement = Self {
            name: String::new(),
            slug: String::new(),
            color: String::new(),
            terminal: false,
        };
        if let Value::Map(entries) = value {
            for (key, entry) in entries {
                match (key.as_str(), entry) {
                    (Some("name"), Value::String(s)) => {
                        announcement.name = s.as_str().unwrap_or_default().to_string();
                    }
                    (Some("slug"), Value::String(s)) => {
                        announcement.slug = s.as_str().unwrap_or_default().to_string();
                    }
                    (Some("color"), Value::String(s)) => {
                        announcement.color = s.as_str().unwrap_or_default().to_string();
                    }
                    (Some("terminal"), Value::Boolean(b)) => announcement.terminal = *b,
                    _ => {}
                }
            }
        }
        announcement
    }
}

/// The closed set of hub packets.
#[derive(Clone, PartialEq)]
pub enum Packet {
    /// Request packet data to be returned via a Pong.
    Ping {
        /// Opaque data.
        data: Vec<u8>,
    },
    /// Response to a Ping packet, carrying the Ping's data back.
    Pong {
        /// Data received from the Ping.
        data: Vec<u8>,
    },
    /// A message to be written to debug logs.
    Log {
        /// Message to log.
        message: String,
    },
    /// Info message, logged at a higher priority than Log.
    Info {
        /// Message to log.
        message: String,
    },
    /// Declare the apps exposed by this bridge.
    DeclareApps {
        /// Exposed apps.
        apps: Vec<AppAnnouncement>,
    },
    /// Open a new session for an app.
    SessionOpen {
        /// Hub-assigned session identity.
        session_id: String,
        /// Hub-side application identity.
        app_id: String,
        /// Slug of the app to launch.
        application_slug: String,
        /// Addressing token for data packets.
        route_key: String,
        /// Initial terminal width.
        width: i64,
        /// Initial terminal height.
        height: i64,
    },
    /// Close an existing session.
    SessionClose {
        /// Session identity.
        session_id: String,
        /// Route key.
        route_key: String,
    },
    /// Data for a session, addressed by route key.
    SessionData {
        /// Route key.
        route_key: String,
        /// Opaque terminal bytes.
        data: Vec<u8>,
    },
    /// Per-route ping.
    RoutePing {
        /// Route key.
        route_key: String,
        /// Opaque data echoed in the pong.
        data: String,
    },
    /// Per-route pong.
    RoutePong {
        /// Route key.
        route_key: String,
        /// Data from the RoutePing.
        data: String,
    },
    /// The end-user's terminal changed dimensions.
    NotifyTerminalSize {
        /// Session identity.
        session_id: String,
        /// New width.
        width: i64,
        /// New height.
        height: i64,
    },
    /// The remote app gained focus.
    Focus {
        /// Route key.
        route_key: String,
    },
    /// The remote app lost focus.
    Blur {
        /// Route key.
        route_key: String,
    },
    /// Ask the hub to open a URL in the end-user's browser.
    OpenUrl {
        /// Route key.
        route_key: String,
        /// URL to open.
        url: String,
        /// Whether to open in a new tab.
        new_tab: bool,
    },
    /// A pre-encoded binary message forwarded verbatim.
    BinaryEncodedMessage {
        /// Route key.
        route_key: String,
        /// Encoded payload.
        data: Vec<u8>,
    },
    /// The app is ready to send a file.
    DeliverFileStart {
        /// Route key.
        route_key: String,
        /// Key identifying the delivery.
        delivery_key: String,
        /// Name of the file.
        file_name: String,
        /// How the browser should open the file.
        open_method: String,
        /// MIME type of the file.
        mime_type: String,
        /// Encoding of the file contents.
        encoding: String,
    },
    /// The hub requests a chunk of a file from the running app.
    RequestDeliverChunk {
        /// Route key.
        route_key: String,
        /// Key identifying the delivery.
        delivery_key: String,
        /// Requested chunk size.
        chunk_size: i64,
    },
}

impl Packet {
    /// The integer type id of this packet on the wire.
    #[must_use]
    pub fn type_id(&self) -> i64 {
        match self {
            Self::Ping { .. } => 1,
            Self::Pong { .. } => 2,
            Self::Log { .. } => 3,
            Self::Info { .. } => 4,
            Self::DeclareApps { .. } => 5,
            Self::SessionOpen { .. } => 6,
            Self::SessionClose { .. } => 7,
            Self::SessionData { .. } => 8,
            Self::RoutePing { .. } => 9,
            Self::RoutePong { .. } => 10,
            Self::NotifyTerminalSize { .. } => 11,
            Self::Focus { .. } => 12,
            Self::Blur { .. } => 13,
            Self::OpenUrl { .. } => 14,
            Self::BinaryEncodedMessage { .. } => 15,
            Self::DeliverFileStart { .. } => 16,
            Self::RequestDeliverChunk { .. } => 17,
        }
    }

    /// The packet's name, for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::Log { .. } => "Log",
            Self::Info { .. } => "Info",
            Self::DeclareApps { .. } => "DeclareApps",
            Self::SessionOpen { .. } => "SessionOpen",
            Self::SessionClose { .. } => "SessionClose",
            Self::SessionData { .. } => "SessionData",
            Self::RoutePing { .. } => "RoutePing",
            Self::RoutePong { .. } => "RoutePong",
            Self::NotifyTerminalSize { .. } => "NotifyTerminalSize",
            Self::Focus { .. } => "Focus",
            Self::Blur { .. } => "Blur",
            Self::OpenUrl { .. } => "OpenUrl",
            Self::BinaryEncodedMessage { .. } => "BinaryEncodedMessage",
            Self::DeliverFileStart { .. } => "DeliverFileStart",
            Self::RequestDeliverChunk { .. } => "RequestDeliverChunk",
        }
    }

    /// Encode the packet as a MessagePack envelope.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Envelope`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let envelope = self.to_envelope();
        let mut buffer = Vec::new();
        rmpv::encode::write_value(&mut buffer, &envelope)
            .map_err(|error| PacketError::Envelope(error.to_string()))?;
        Ok(buffer)
    }

    fn to_envelope(&self) -> Value {
        let mut fields: Vec<Value> = vec![Value::from(self.type_id())];
        match self {
            Self::Ping { data } | Self::Pong { data } => {
                fields.push(Value::Binary(data.clone()));
            }
            Self::Log { message } | Self::Info { message } => {
                fields.push(Value::from(message.as_str()));
            }
            Self::DeclareApps { apps } => {
                fields.push(Value::Array(apps.iter().map(AppAnnouncement::to_value).collect()));
            }
            Self::SessionOpen {
                session_id,
                app_id,
                application_slug,
                route_key,
                width,
                height,
            } => {
                fields.push(Value::from(session_id.as_str()));
                fields.push(Value::from(app_id.as_str()));
                fields.push(Value::from(application_slug.as_str()));
                fields.push(Value::from(route_key.as_str()));
                fields.push(Value::from(*width));
                fields.push(Value::from(*height));
            }
            Self::SessionClose {
                session_id,
                route_key,
            } => {
                fields.push(Value::from(session_id.as_str()));
                fields.push(Value::from(route_key.as_str()));
            }
            Self::SessionData { route_key, data }
            | Self::BinaryEncodedMessage { route_key, data } => {
                fields.push(Value::from(route_key.as_str()));
                fields.push(Value::Binary(data.clone()));
            }
            Self::RoutePing { route_key, data } | Self::RoutePong { route_key, data } => {
                fields.push(Value::from(route_key.as_str()));
                fields.push(Value::from(data.as_str()));
            }
            Self::NotifyTerminalSize {
                session_id,
                width,
                height,
            } => {
                fields.push(Value::from(session_id.as_str()));
                fields.push(Value::from(*width));
                fields.push(Value::from(*height));
            }
            Self::Focus { route_key } | Self::Blur { route_key } => {
                fields.push(Value::from(route_key.as_str()));
            }
            Self::OpenUrl {
                route_key,
                url,
                new_tab,
            } => {
                fields.push(Value::from(route_key.as_str()));
                fields.push(Value::from(url.as_str()));
                fields.push(Value::from(*new_tab));
            }
            Self::DeliverFileStart {
                route_key,
                delivery_key,
                file_name,
                open_method,
                mime_type,
                encoding,
            } => {
                fields.push(Value::from(route_key.as_str()));
                fields.push(Value::from(delivery_key.as_str()));
                fields.push(Value::from(file_name.as_str()));
                fields.push(Value::from(open_method.as_str()));
                fields.push(Value::from(mime_type.as_str()));
                fields.push(Value::from(encoding.as_str()));
            }
            Self::RequestDeliverChunk {
                route_key,
                delivery_key,
                chunk_size,
            } => {
                fields.push(Value::from(route_key.as_str()));
                fields.push(Value::from(delivery_key.as_str()));
                fields.push(Value::from(*chunk_size));
            }
        }
        Value::Array(fields)
    }

    /// Decode a MessagePack payload into a packet.
    ///
    /// Returns `Ok(None)` for envelopes with an unknown type id so new hub
    /// packets do not crash old clients.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the payload is not a MessagePack array, the
    /// envelope is empty, the type id is not an integer, or any declared
    /// field is missing or mistyped.
    pub fn decode(payload: &[u8]) -> Result<Option<Self>, PacketError> {
        let value = rmpv::decode::read_value(&mut &payload[..])
            .map_err(|error| PacketError::Envelope(error.to_string()))?;
        let Value::Array(envelope) = value else {
            return Err(PacketError::Envelope(
                "expected an array envelope".to_string(),
            ));
        };
        Self::decode_envelope(envelope)
    }

    /// Decode an already-unpacked envelope.
    ///
    /// Fields beyond the packet's declared arity are silently dropped; this
    /// is the protocol's extension mechanism.
    ///
    /// # Errors
    ///
    /// See [`Packet::decode`].
    pub fn decode_envelope(envelope: Vec<Value>) -> Result<Option<Self>, PacketError> {
        let mut fields = envelope.into_iter();
        let type_id = match fields.next() {
            None => return Err(PacketError::Empty),
            Some(Value::Integer(id)) => id.as_i64().ok_or(PacketError::TypeIdNotInt)?,
            Some(_) => return Err(PacketError::TypeIdNotInt),
        };

        let packet = match type_id {
            1 => Self::Ping {
                data: take_bytes(fields.next(), "Ping", "data")?,
            },
            2 => Self::Pong {
                data: take_bytes(fields.next(), "Pong", "data")?,
            },
            3 => Self::Log {
                message: take_str(fields.next(), "Log", "message")?,
            },
            4 => Self::Info {
                message: take_str(fields.next(), "Info", "message")?,
            },
            5 => Self::DeclareApps {
                apps: take_list(fields.next(), "DeclareApps", "apps")?
                    .iter()
                    .map(AppAnnouncement::from_value)
                    .collect(),
            },
            6 => Self::SessionOpen {
                session_id: take_str(fields.next(), "SessionOpen", "session_id")?,
                app_id: take_str(fields.next(), "SessionOpen", "app_id")?,
                application_slug: take_str(fields.next(), "SessionOpen", "application_slug")?,
                route_key: take_str(fields.next(), "SessionOpen", "route_key")?,
                width: take_int(fields.next(), "SessionOpen", "width")?,
                height: take_int(fields.next(), "SessionOpen", "height")?,
            },
            7 => Self::SessionClose {
                session_id: take_str(fields.next(), "SessionClose", "session_id")?,
                route_key: take_str(fields.next(), "SessionClose", "route_key")?,
            },
            8 => Self::SessionData {
                route_key: take_str(fields.next(), "SessionData", "route_key")?,
                data: take_bytes(fields.next(), "SessionData", "data")?,
            },
            9 => Self::RoutePing {
                route_key: take_str(fields.next(), "RoutePing", "route_key")?,
                data: take_str(fields.next(), "RoutePing", "data")?,
            },
            10 => Self::RoutePong {
                route_key: take_str(fields.next(), "RoutePong", "route_key")?,
                data: take_str(fields.next(), "RoutePong", "data")?,
            },
            11 => Self::NotifyTerminalSize {
                session_id: take_str(fields.next(), "NotifyTerminalSize", "session_id")?,
                width: take_int(fields.next(), "NotifyTerminalSize", "width")?,
                height: take_int(fields.next(), "NotifyTerminalSize", "height")?,
            },
            12 => Self::Focus {
                route_key: take_str(fields.next(), "Focus", "route_key")?,
            },
            13 => Self::Blur {
                route_key: take_str(fields.next(), "Blur", "route_key")?,
            },
            14 => Self::OpenUrl {
                route_key: take_str(fields.next(), "OpenUrl", "route_key")?,
                url: take_str(fields.next(), "OpenUrl", "url")?,
                new_tab: take_bool(fields.next(), "OpenUrl", "new_tab")?,
            },
            15 => Self::BinaryEncodedMessage {
                route_key: take_str(fields.next(), "BinaryEncodedMessage", "route_key")?,
                data: take_bytes(fields.next(), "BinaryEncodedMessage", "data")?,
            },
            16 => Self::DeliverFileStart {
                route_key: take_str(fields.next(), "DeliverFileStart", "route_key")?,
                delivery_key: take_str(fields.next(), "DeliverFileStart", "delivery_key")?,
                file_name: take_str(fields.next(), "DeliverFileStart", "file_name")?,
                open_method: take_str(fields.next(), "DeliverFileStart", "open_method")?,
                mime_type: take_str(fields.next(), "DeliverFileStart", "mime_type")?,
                encoding: take_str(fields.next(), "DeliverFileStart", "encoding")?,
            },
            17 => Self::RequestDeliverChunk {
                route_key: take_str(fields.next(), "RequestDeliverChunk", "route_key")?,
                delivery_key: take_str(fields.next(), "RequestDeliverChunk", "delivery_key")?,
                chunk_size: take_int(fields.next(), "RequestDeliverChunk", "chunk_size")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(packet))
    }
}

/// Abbreviated debug form so large payloads don't flood the logs.
impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping { data } => write!(f, "Ping(<{} bytes>)", data.len()),
            Self::Pong { data } => write!(f, "Pong(<{} bytes>)", data.len()),
            Self::Log { message } => write!(f, "Log({message:?})"),
            Self::Info { message } => write!(f, "Info({message:?})"),
            Self::DeclareApps { apps } => write!(f, "DeclareApps({} app(s))", apps.len()),
            Self::SessionOpen {
                session_id,
                application_slug,
                route_key,
                width,
                height,
                ..
            } => write!(
                f,
                "SessionOpen({session_id:?}, {application_slug:?}, {route_key:?}, {width}x{height})"
            ),
            Self::SessionClose {
                session_id,
                route_key,
            } => write!(f, "SessionClose({session_id:?}, {route_key:?})"),
            Self::SessionData { route_key, data } => {
                write!(f, "SessionData({route_key:?}, <{} bytes>)", data.len())
            }
            Self::RoutePing { route_key, .. } => write!(f, "RoutePing({route_key:?})"),
            Self::RoutePong { route_key, .. } => write!(f, "RoutePong({route_key:?})"),
            Self::NotifyTerminalSize {
                session_id,
                width,
                height,
            } => write!(f, "NotifyTerminalSize({session_id:?}, {width}x{height})"),
            Self::Focus { route_key } => write!(f, "Focus({route_key:?})"),
            Self::Blur { route_key } => write!(f, "Blur({route_key:?})"),
            Self::OpenUrl { route_key, url, .. } => {
                write!(f, "OpenUrl({route_key:?}, {url:?})")
            }
            Self::BinaryEncodedMessage { route_key, data } => write!(
                f,
                "BinaryEncodedMessage({route_key:?}, <{} bytes>)",
                data.len()
            ),
            Self::DeliverFileStart {
                route_key,
                delivery_key,
                file_name,
                ..
            } => write!(
                f,
                "DeliverFileStart({route_key:?}, {delivery_key:?}, {file_name:?})"
            ),
            Self::RequestDeliverChunk {
                route_key,
                delivery_key,
                chunk_size,
            } => write!(
                f,
                "RequestDeliverChunk({route_key:?}, {delivery_key:?}, {chunk_size})"
            ),
        }
    }
}

fn mismatch(
    packet: &'static str,
    field: &'static str,
    expected: &'static str,
) -> PacketError {
    PacketError::TypeMismatch {
        packet,
        field,
        expected,
    }
}

fn take_int(
    value: Option<Value>,
    packet: &'static str,
    field: &'static str,
) -> Result<i64, PacketError> {
    match value {
        Some(Value::Integer(int)) => int.as_i64().ok_or_else(|| mismatch(packet, field, "int")),
        _ => Err(mismatch(packet, field, "int")),
    }
}

fn take_str(
    value: Option<Value>,
    packet: &'static str,
    field: &'static str,
) -> Result<String, PacketError> {
    match value {
        Some(Value::String(string)) => string
            .into_str()
            .ok_or_else(|| mismatch(packet, field, "str")),
        _ => Err(mismatch(packet, field, "str")),
    }
}

fn take_bytes(
    value: Option<Value>,
    packet: &'static str,
    field: &'static str,
) -> Result<Vec<u8>, PacketError> {
    match value {
        Some(Value::Binary(bytes)) => Ok(bytes),
        _ => Err(mismatch(packet, field, "bytes")),
    }
}

fn take_bool(
    value: Option<Value>,
    packet: &'static str,
    field: &'static str,
) -> Result<bool, PacketError> {
    match value {
        Some(Value::Boolean(flag)) => Ok(flag),
        _ => Err(mismatch(packet, field, "bool")),
    }
}

fn take_list(
    value: Option<Value>,
    packet: &'static str,
    field: &'static str,
) -> Result<Vec<Value>, PacketError> {
    match value {
        Some(Value::Array(values)) => Ok(values),
        _ => Err(mismatch(packet, field, "list")),
    }
}
