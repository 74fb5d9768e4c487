//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages used by the
//! client. Both directions can be encoded and decoded, which lets tests play
//! the server side of a conversation.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Size of a tagged message header: type byte + Int32 length.
pub const HEADER_LEN: usize = 5;

/// Largest frame accepted from the server.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Largest element count of a message: counts are sent as unsigned Int16.
pub const MAX_PARAMS: usize = u16::MAX as usize;

/// Raw column values of one DataRow, `None` for SQL NULL.
pub type RowValues = SmallVec<[Option<Bytes>; 16]>;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl TryFrom<i16> for Format {
    type Error = PgError;

    fn try_from(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            _ => Err(PgError::protocol(format!("Unknown format code: {}", code))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            _ => Err(PgError::protocol(format!(
                "Unknown transaction status: {}",
                b as char
            ))),
        }
    }
}

/// What a Describe message asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

impl DescribeTarget {
    fn as_byte(self) -> u8 {
        match self {
            DescribeTarget::Statement => b'S',
            DescribeTarget::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Startup message sent at connection start (untagged).
    Startup {
        user: String,
        database: Option<String>,
        options: Vec<(String, String)>,
    },
    /// Password message (cleartext or MD5 token).
    Password { password: String },
    /// First SCRAM message.
    SaslInitialResponse { mechanism: String, data: Bytes },
    /// Subsequent SCRAM messages.
    SaslResponse { data: Bytes },
    /// Simple query.
    Query { sql: String },
    /// Creates a prepared statement. An empty name is the unnamed statement.
    Parse {
        name: String,
        sql: String,
        param_types: Vec<Oid>,
    },
    /// Binds parameters to a prepared statement.
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<Format>,
        params: Vec<Option<Bytes>>,
        result_formats: Vec<Format>,
    },
    Describe { target: DescribeTarget, name: String },
    /// Executes a bound portal. `max_rows` of 0 means no limit.
    Execute { portal: String, max_rows: i32 },
    Sync,
    Flush,
    Terminate,
}

impl FrontendMessage {
    /// The message type byte, `None` for the untagged startup message.
    pub fn tag(&self) -> Option<u8> {
        match self {
            FrontendMessage::Startup { .. } => None,
            FrontendMessage::Password { .. }
            | FrontendMessage::SaslInitialResponse { .. }
            | FrontendMessage::SaslResponse { .. } => Some(b'p'),
            FrontendMessage::Query { .. } => Some(b'Q'),
            FrontendMessage::Parse { .. } => Some(b'P'),
            FrontendMessage::Bind { .. } => Some(b'B'),
            FrontendMessage::Describe { .. } => Some(b'D'),
            FrontendMessage::Execute { .. } => Some(b'E'),
            FrontendMessage::Sync => Some(b'S'),
            FrontendMessage::Flush => Some(b'H'),
            FrontendMessage::Terminate => Some(b'X'),
        }
    }

    /// Append the encoded message to `buf`.
    ///
    /// Several messages encoded into the same buffer are written to the
    /// server back-to-back in one write.
    pub fn encode(&self, buf: &mut BytesMut) {
        frame(buf, self.tag(), |body| match self {
            FrontendMessage::Startup {
                user,
                database,
                options,
            } => {
                body.put_i32(PROTOCOL_VERSION);
                put_cstring(body, "user");
                put_cstring(body, user);
                if let Some(db) = database {
                    put_cstring(body, "database");
                    put_cstring(body, db);
                }
                for (key, value) in options {
                    put_cstring(body, key);
                    put_cstring(body, value);
                }
                // Terminator
                body.put_u8(0);
            }
            FrontendMessage::Password { password } => put_cstring(body, password),
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                put_cstring(body, mechanism);
                body.put_i32(data.len() as i32);
                body.put_slice(data);
            }
            FrontendMessage::SaslResponse { data } => body.put_slice(data),
            FrontendMessage::Query { sql } => put_cstring(body, sql),
            FrontendMessage::Parse {
                name,
                sql,
                param_types,
            } => {
                put_cstring(body, name);
                put_cstring(body, sql);
                put_count(body, param_types.len());
                for oid in param_types {
                    body.put_i32(oid.as_i32());
                }
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                put_cstring(body, portal);
                put_cstring(body, statement);
                put_count(body, param_formats.len());
                for fmt in param_formats {
                    body.put_i16(*fmt as i16);
                }
                put_count(body, params.len());
                for param in params {
                    put_value(body, param.as_ref());
                }
                put_count(body, result_formats.len());
                for fmt in result_formats {
                    body.put_i16(*fmt as i16);
                }
            }
            FrontendMessage::Describe { target, name } => {
                body.put_u8(target.as_byte());
                put_cstring(body, name);
            }
            FrontendMessage::Execute { portal, max_rows } => {
                put_cstring(body, portal);
                body.put_i32(*max_rows);
            }
            FrontendMessage::Sync | FrontendMessage::Flush | FrontendMessage::Terminate => {}
        });
    }

    /// Decode an untagged startup message.
    pub fn decode_startup(buf: &mut Bytes) -> PgResult<Self> {
        let len = get_i32(buf)?;
        let mut body = take_body(buf, len)?;

        let version = get_i32(&mut body)?;
        if version != PROTOCOL_VERSION {
            return Err(PgError::protocol(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }

        let mut user = None;
        let mut database = None;
        let mut options = Vec::new();
        loop {
            let key = read_cstring(&mut body)?;
            if key.is_empty() {
                break;
            }
            let value = read_cstring(&mut body)?;
            match key.as_str() {
                "user" => user = Some(value),
                "database" => database = Some(value),
                _ => options.push((key, value)),
            }
        }

        Ok(FrontendMessage::Startup {
            user: user.ok_or_else(|| PgError::protocol("Startup message without user"))?,
            database,
            options,
        })
    }

    /// Decode a tagged frontend message.
    ///
    /// `p` is decoded as [`FrontendMessage::Password`]: SASL responses share
    /// the tag and can only be told apart by the authentication exchange.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        let (tag, mut body) = split_frame(buf)?;

        let msg = match tag {
            b'p' => FrontendMessage::Password {
                password: read_cstring(&mut body)?,
            },
            b'Q' => FrontendMessage::Query {
                sql: read_cstring(&mut body)?,
            },
            b'P' => {
                let name = read_cstring(&mut body)?;
                let sql = read_cstring(&mut body)?;
                let count = get_count(&mut body)?;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(Oid::from_i32(get_i32(&mut body)?));
                }
                FrontendMessage::Parse {
                    name,
                    sql,
                    param_types,
                }
            }
            b'B' => {
                let portal = read_cstring(&mut body)?;
                let statement = read_cstring(&mut body)?;
                let param_formats = read_formats(&mut body)?;
                let count = get_count(&mut body)?;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    params.push(read_value(&mut body)?);
                }
                let result_formats = read_formats(&mut body)?;
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            b'D' => {
                let target = match get_u8(&mut body)? {
                    b'S' => DescribeTarget::Statement,
                    b'P' => DescribeTarget::Portal,
                    other => {
                        return Err(PgError::protocol(format!(
                            "Unknown describe target: {}",
                            other as char
                        )))
                    }
                };
                FrontendMessage::Describe {
                    target,
                    name: read_cstring(&mut body)?,
                }
            }
            b'E' => FrontendMessage::Execute {
                portal: read_cstring(&mut body)?,
                max_rows: get_i32(&mut body)?,
            },
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'X' => FrontendMessage::Terminate,
            _ => {
                return Err(PgError::protocol(format!(
                    "Unknown frontend message type: {}",
                    tag as char
                )))
            }
        };

        Ok(msg)
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

impl FieldDescription {
    /// A text-format column not tied to a table.
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: Format::Text,
        }
    }
}

/// Authentication request from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
}

impl Authentication {
    /// Whether the server accepted the client without (further) credentials.
    pub fn is_ok(&self) -> bool {
        matches!(self, Authentication::Ok)
    }

    /// The MD5 salt when the server asked for an MD5 password.
    pub fn md5_salt(&self) -> Option<[u8; 4]> {
        match self {
            Authentication::Md5Password { salt } => Some(*salt),
            _ => None,
        }
    }
}

/// Fields of an ErrorResponse or NoticeResponse, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    fields: Vec<(u8, String)>,
}

impl ErrorFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, e.g. `with(b'C', "42P01")`.
    pub fn with(mut self, code: u8, value: impl Into<String>) -> Self {
        self.fields.push((code, value.into()));
        self
    }

    pub fn get(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    /// Severity, preferring the non-localized `V` field when present.
    pub fn severity(&self) -> Option<&str> {
        self.get(b'V').or_else(|| self.get(b'S'))
    }

    /// SQLSTATE code.
    pub fn code(&self) -> Option<&str> {
        self.get(b'C')
    }

    pub fn message(&self) -> Option<&str> {
        self.get(b'M')
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.fields.iter().map(|(c, v)| (*c, v.as_str()))
    }
}

/// Backend message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(Authentication),

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: RowValues },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// The message type byte.
    pub fn tag(&self) -> u8 {
        match self {
            BackendMessage::Authentication(_) => b'R',
            BackendMessage::RowDescription { .. } => b'T',
            BackendMessage::DataRow { .. } => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::BindComplete => b'2',
            BackendMessage::CloseComplete => b'3',
            BackendMessage::NoData => b'n',
            BackendMessage::PortalSuspended => b's',
            BackendMessage::ParameterDescription { .. } => b't',
            BackendMessage::ReadyForQuery { .. } => b'Z',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ErrorResponse(_) => b'E',
            BackendMessage::NoticeResponse(_) => b'N',
            BackendMessage::NotificationResponse { .. } => b'A',
        }
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte. Exactly one
    /// message is consumed from it.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        let (msg_type, body) = split_frame(buf)?;

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse(read_error_fields(body)?)),
            b'N' => Ok(BackendMessage::NoticeResponse(read_error_fields(body)?)),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(PgError::protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        let auth_type = get_i32(&mut body)?;

        let auth = match auth_type {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => {
                let salt_bytes = take(&mut body, 4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&salt_bytes);
                Authentication::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Authentication::Sasl { mechanisms }
            }
            11 => Authentication::SaslContinue { data: body },
            12 => Authentication::SaslFinal { data: body },
            _ => {
                return Err(PgError::protocol(format!(
                    "Unsupported authentication type: {}",
                    auth_type
                )))
            }
        };

        Ok(BackendMessage::Authentication(auth))
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        let num_fields = get_count(&mut body)?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: read_cstring(&mut body)?,
                table_oid: get_i32(&mut body)?,
                column_attr: get_i16(&mut body)?,
                type_oid: Oid::from_i32(get_i32(&mut body)?),
                type_size: get_i16(&mut body)?,
                type_modifier: get_i32(&mut body)?,
                format: Format::try_from(get_i16(&mut body)?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        let num_cols = get_count(&mut body)?;
        let mut values = RowValues::with_capacity(num_cols);

        for _ in 0..num_cols {
            values.push(read_value(&mut body)?);
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> PgResult<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> PgResult<Self> {
        let status = TransactionStatus::try_from(get_u8(&mut body)?)?;
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> PgResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> PgResult<Self> {
        Ok(BackendMessage::BackendKeyData {
            process_id: get_i32(&mut body)?,
            secret_key: get_i32(&mut body)?,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        let num_params = get_count(&mut body)?;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(get_i32(&mut body)?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> PgResult<Self> {
        Ok(BackendMessage::NotificationResponse {
            process_id: get_i32(&mut body)?,
            channel: read_cstring(&mut body)?,
            payload: read_cstring(&mut body)?,
        })
    }

    /// Append the encoded message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        frame(buf, Some(self.tag()), |body| match self {
            BackendMessage::Authentication(auth) => match auth {
                Authentication::Ok => body.put_i32(0),
                Authentication::CleartextPassword => body.put_i32(3),
                Authentication::Md5Password { salt } => {
                    body.put_i32(5);
                    body.put_slice(salt);
                }
                Authentication::Sasl { mechanisms } => {
                    body.put_i32(10);
                    for mech in mechanisms {
                        put_cstring(body, mech);
                    }
                    body.put_u8(0);
                }
                Authentication::SaslContinue { data } => {
                    body.put_i32(11);
                    body.put_slice(data);
                }
                Authentication::SaslFinal { data } => {
                    body.put_i32(12);
                    body.put_slice(data);
                }
            },
            BackendMessage::RowDescription { fields } => {
                put_count(body, fields.len());
                for field in fields {
                    put_cstring(body, &field.name);
                    body.put_i32(field.table_oid);
                    body.put_i16(field.column_attr);
                    body.put_i32(field.type_oid.as_i32());
                    body.put_i16(field.type_size);
                    body.put_i32(field.type_modifier);
                    body.put_i16(field.format as i16);
                }
            }
            BackendMessage::DataRow { values } => {
                put_count(body, values.len());
                for value in values {
                    put_value(body, value.as_ref());
                }
            }
            BackendMessage::CommandComplete { tag } => put_cstring(body, tag),
            BackendMessage::ParameterDescription { type_oids } => {
                put_count(body, type_oids.len());
                for oid in type_oids {
                    body.put_i32(oid.as_i32());
                }
            }
            BackendMessage::ReadyForQuery { status } => body.put_u8(status.as_byte()),
            BackendMessage::ParameterStatus { name, value } => {
                put_cstring(body, name);
                put_cstring(body, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                body.put_i32(*process_id);
                body.put_i32(*secret_key);
            }
            BackendMessage::ErrorResponse(fields) | BackendMessage::NoticeResponse(fields) => {
                for (code, value) in fields.iter() {
                    body.put_u8(code);
                    put_cstring(body, value);
                }
                body.put_u8(0);
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                body.put_i32(*process_id);
                put_cstring(body, channel);
                put_cstring(body, payload);
            }
            BackendMessage::EmptyQueryResponse
            | BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended => {}
        });
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Write an optional tag, a length placeholder and the body, then fill in the
/// length (which counts itself but not the tag).
fn frame(buf: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Split one tagged frame off the front of `buf`.
fn split_frame(buf: &mut Bytes) -> PgResult<(u8, Bytes)> {
    if buf.remaining() < HEADER_LEN {
        return Err(PgError::protocol("Incomplete message header"));
    }
    let tag = buf.get_u8();
    let len = buf.get_i32();
    Ok((tag, take_body(buf, len)?))
}

/// Take the body of a frame whose length field (already read) was `len`.
fn take_body(buf: &mut Bytes, len: i32) -> PgResult<Bytes> {
    let len = usize::try_from(len)
        .ok()
        .filter(|len| (4..=MAX_MESSAGE_LEN).contains(len))
        .ok_or_else(|| PgError::protocol(format!("Invalid message length: {}", len)))?;

    if buf.remaining() < len - 4 {
        return Err(PgError::protocol("Incomplete message body"));
    }
    Ok(buf.split_to(len - 4))
}

fn take(buf: &mut Bytes, n: usize) -> PgResult<Bytes> {
    if buf.remaining() < n {
        return Err(PgError::protocol("Message body too short"));
    }
    Ok(buf.split_to(n))
}

fn get_u8(buf: &mut Bytes) -> PgResult<u8> {
    if !buf.has_remaining() {
        return Err(PgError::protocol("Message body too short"));
    }
    Ok(buf.get_u8())
}

fn get_i16(buf: &mut Bytes) -> PgResult<i16> {
    if buf.remaining() < 2 {
        return Err(PgError::protocol("Message body too short"));
    }
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> PgResult<i32> {
    if buf.remaining() < 4 {
        return Err(PgError::protocol("Message body too short"));
    }
    Ok(buf.get_i32())
}

/// Read an Int16 element count.
fn get_count(buf: &mut Bytes) -> PgResult<usize> {
    if buf.remaining() < 2 {
        return Err(PgError::protocol("Message body too short"));
    }
    Ok(usize::from(buf.get_u16()))
}

/// Counts above [`MAX_PARAMS`] must be rejected before encoding.
fn put_count(buf: &mut BytesMut, count: usize) {
    debug_assert!(count <= MAX_PARAMS, "element count {} overflows Int16", count);
    buf.put_u16(count as u16);
}

/// Read a length-prefixed value, -1 meaning NULL.
fn read_value(buf: &mut Bytes) -> PgResult<Option<Bytes>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    take(buf, len as usize).map(Some)
}

fn put_value(buf: &mut BytesMut, value: Option<&Bytes>) {
    match value {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
}

fn read_formats(buf: &mut Bytes) -> PgResult<Vec<Format>> {
    let count = get_count(buf)?;
    let mut formats = Vec::with_capacity(count);
    for _ in 0..count {
        formats.push(Format::try_from(get_i16(buf)?)?);
    }
    Ok(formats)
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::protocol("Missing null terminator in string"))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<ErrorFields> {
    let mut fields = ErrorFields::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields = fields.with(field_type, value);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(msg: &FrontendMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        buf
    }

    #[test]
    fn test_startup_message_structure() {
        let msg = FrontendMessage::Startup {
            user: "test".to_string(),
            database: Some("testdb".to_string()),
            options: vec![],
        };

        let encoded = encoded(&msg);

        // Length should be at least 4 (length) + 4 (version) + some params
        assert!(encoded.len() >= 8);

        // Check length field
        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());
    }

    #[test]
    fn test_query_message_structure() {
        let msg = FrontendMessage::Query {
            sql: "SELECT 1".to_string(),
        };

        let encoded = encoded(&msg);

        assert_eq!(encoded[0], b'Q');

        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1); // -1 for message type
    }

    #[test]
    fn test_messages_concatenate_in_order() {
        let mut buf = BytesMut::new();
        FrontendMessage::Sync.encode(&mut buf);
        FrontendMessage::Terminate.encode(&mut buf);

        assert_eq!(&buf[..], &[b'S', 0, 0, 0, 4, b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn test_counts_above_i16_max_are_unsigned() {
        let msg = FrontendMessage::Bind {
            portal: String::new(),
            statement: String::new(),
            param_formats: vec![],
            params: vec![None; 40_000],
            result_formats: vec![],
        };

        let mut frame = encoded(&msg).freeze();

        // tag, length, portal "", statement "", format count, param count
        assert_eq!(u16::from_be_bytes([frame[9], frame[10]]), 40_000);
        assert_eq!(FrontendMessage::decode(&mut frame).unwrap(), msg);
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let mut data = Bytes::from_static(&[b'Z', 0xff, 0xff, 0xff, 0xff, b'I']);
        assert!(matches!(
            BackendMessage::decode(&mut data),
            Err(PgError::Protocol(_))
        ));
    }

    #[test]
    fn test_error_fields_prefer_nonlocalized_severity() {
        let fields = ErrorFields::new()
            .with(b'S', "FEHLER")
            .with(b'V', "ERROR")
            .with(b'C', "22012");

        assert_eq!(fields.severity(), Some("ERROR"));
        assert_eq!(fields.code(), Some("22012"));
        assert_eq!(fields.message(), None);
    }
}
