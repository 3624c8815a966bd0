//! Typed PostgreSQL v3 wire messages
//!
//! Frames are a one-byte tag (absent for startup-phase messages) plus a
//! 4-byte big-endian length that includes itself. Messages the proxy
//! inspects decode to typed variants; anything else decodes to `Opaque`
//! and re-encodes byte-identically, so forwarding never corrupts frames
//! it does not understand.

use super::constants::*;
use bytes::{Buf, BufMut, BytesMut};
use spqr_common::{Result, SpqrError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Messages sent by clients (and by the proxy towards shards)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Startup {
        protocol_version: u32,
        /// Parameter pairs in wire order
        parameters: Vec<(String, String)>,
    },
    SslRequest,
    GssEncRequest,
    CancelRequest {
        process_id: u32,
        secret_key: u32,
    },
    Password(String),
    Query(String),
    Parse {
        statement: String,
        sql: String,
        param_types: Vec<u32>,
    },
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Sync,
    Terminate,
    /// Unknown tag passed through opaquely in forwarding contexts
    Opaque {
        tag: u8,
        body: Vec<u8>,
    },
}

/// One column of a RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl FieldDescription {
    /// A text-format column, the shape every console row uses.
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: 25,
            type_len: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// Messages sent by shards (and by the proxy towards clients)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password {
        salt: [u8; 4],
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: u32,
        secret_key: u32,
    },
    ReadyForQuery {
        status: u8,
    },
    ErrorResponse {
        severity: String,
        code: String,
        message: String,
    },
    NoticeResponse {
        severity: String,
        code: String,
        message: String,
    },
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Vec<u8>>>,
    },
    CommandComplete {
        tag: String,
    },
    Opaque {
        tag: u8,
        body: Vec<u8>,
    },
}

impl FrontendMessage {
    /// Encode to a complete frame, tag and length included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FrontendMessage::Startup {
                protocol_version,
                parameters,
            } => {
                let mut body = BytesMut::new();
                body.put_u32(*protocol_version);
                for (name, value) in parameters {
                    put_cstr(&mut body, name);
                    put_cstr(&mut body, value);
                }
                body.put_u8(0);
                untagged_frame(&body)
            }
            FrontendMessage::SslRequest => {
                let mut body = BytesMut::new();
                body.put_u32(SSL_REQUEST_CODE);
                untagged_frame(&body)
            }
            FrontendMessage::GssEncRequest => {
                let mut body = BytesMut::new();
                body.put_u32(GSSENC_REQUEST_CODE);
                untagged_frame(&body)
            }
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => {
                let mut body = BytesMut::new();
                body.put_u32(CANCEL_REQUEST_CODE);
                body.put_u32(*process_id);
                body.put_u32(*secret_key);
                untagged_frame(&body)
            }
            FrontendMessage::Password(password) => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, password);
                tagged_frame(b'p', &body)
            }
            FrontendMessage::Query(sql) => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, sql);
                tagged_frame(b'Q', &body)
            }
            FrontendMessage::Parse {
                statement,
                sql,
                param_types,
            } => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, statement);
                put_cstr(&mut body, sql);
                body.put_i16(param_types.len() as i16);
                for oid in param_types {
                    body.put_u32(*oid);
                }
                tagged_frame(b'P', &body)
            }
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, portal);
                put_cstr(&mut body, statement);
                body.put_i16(param_formats.len() as i16);
                for format in param_formats {
                    body.put_i16(*format);
                }
                body.put_i16(params.len() as i16);
                for param in params {
                    match param {
                        None => body.put_i32(-1),
                        Some(value) => {
                            body.put_i32(value.len() as i32);
                            body.put_slice(value);
                        }
                    }
                }
                body.put_i16(result_formats.len() as i16);
                for format in result_formats {
                    body.put_i16(*format);
                }
                tagged_frame(b'B', &body)
            }
            FrontendMessage::Execute { portal, max_rows } => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, portal);
                body.put_i32(*max_rows);
                tagged_frame(b'E', &body)
            }
            FrontendMessage::Sync => tagged_frame(b'S', &BytesMut::new()),
            FrontendMessage::Terminate => tagged_frame(b'X', &BytesMut::new()),
            FrontendMessage::Opaque { tag, body } => {
                let mut buf = BytesMut::new();
                buf.put_slice(body);
                tagged_frame(*tag, &buf)
            }
        }
    }

    /// Decode a tagged frontend frame body.
    pub fn decode(tag: u8, body: &[u8]) -> Result<Self> {
        let mut buf = body;
        let msg = match tag {
            b'p' => FrontendMessage::Password(get_cstr(&mut buf)?),
            b'Q' => FrontendMessage::Query(get_cstr(&mut buf)?),
            b'P' => {
                let statement = get_cstr(&mut buf)?;
                let sql = get_cstr(&mut buf)?;
                let n = get_i16(&mut buf)?;
                let mut param_types = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    param_types.push(get_u32(&mut buf)?);
                }
                FrontendMessage::Parse {
                    statement,
                    sql,
                    param_types,
                }
            }
            b'B' => {
                let portal = get_cstr(&mut buf)?;
                let statement = get_cstr(&mut buf)?;
                let n_formats = get_i16(&mut buf)?;
                let mut param_formats = Vec::with_capacity(n_formats.max(0) as usize);
                for _ in 0..n_formats {
                    param_formats.push(get_i16(&mut buf)?);
                }
                let n_params = get_i16(&mut buf)?;
                let mut params = Vec::with_capacity(n_params.max(0) as usize);
                for _ in 0..n_params {
                    let len = get_i32(&mut buf)?;
                    if len < 0 {
                        params.push(None);
                    } else {
                        params.push(Some(get_bytes(&mut buf, len as usize)?));
                    }
                }
                let n_results = get_i16(&mut buf)?;
                let mut result_formats = Vec::with_capacity(n_results.max(0) as usize);
                for _ in 0..n_results {
                    result_formats.push(get_i16(&mut buf)?);
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            b'E' => {
                let portal = get_cstr(&mut buf)?;
                let max_rows = get_i32(&mut buf)?;
                FrontendMessage::Execute { portal, max_rows }
            }
            b'S' => FrontendMessage::Sync,
            b'X' => FrontendMessage::Terminate,
            _ => FrontendMessage::Opaque {
                tag,
                body: body.to_vec(),
            },
        };
        Ok(msg)
    }

    /// Decode a startup-phase frame (no tag byte).
    pub fn decode_startup(body: &[u8]) -> Result<Self> {
        let mut buf = body;
        let code = get_u32(&mut buf)?;

        let msg = match code {
            SSL_REQUEST_CODE => FrontendMessage::SslRequest,
            GSSENC_REQUEST_CODE => FrontendMessage::GssEncRequest,
            CANCEL_REQUEST_CODE => FrontendMessage::CancelRequest {
                process_id: get_u32(&mut buf)?,
                secret_key: get_u32(&mut buf)?,
            },
            version if version >> 16 == 3 => {
                let mut parameters = Vec::new();
                loop {
                    let name = get_cstr(&mut buf)?;
                    if name.is_empty() {
                        break;
                    }
                    let value = get_cstr(&mut buf)?;
                    parameters.push((name, value));
                }
                FrontendMessage::Startup {
                    protocol_version: version,
                    parameters,
                }
            }
            other => {
                return Err(SpqrError::Protocol(format!(
                    "unsupported startup code {}",
                    other
                )))
            }
        };
        Ok(msg)
    }
}

impl BackendMessage {
    /// Encode to a complete frame, tag and length included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            BackendMessage::AuthenticationOk => auth_frame(0, None),
            BackendMessage::AuthenticationCleartextPassword => auth_frame(3, None),
            BackendMessage::AuthenticationMd5Password { salt } => auth_frame(5, Some(salt)),
            BackendMessage::ParameterStatus { name, value } => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, name);
                put_cstr(&mut body, value);
                tagged_frame(b'S', &body)
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                let mut body = BytesMut::new();
                body.put_u32(*process_id);
                body.put_u32(*secret_key);
                tagged_frame(b'K', &body)
            }
            BackendMessage::ReadyForQuery { status } => {
                let mut body = BytesMut::new();
                body.put_u8(*status);
                tagged_frame(b'Z', &body)
            }
            BackendMessage::ErrorResponse {
                severity,
                code,
                message,
            } => notice_like_frame(b'E', severity, code, message),
            BackendMessage::NoticeResponse {
                severity,
                code,
                message,
            } => notice_like_frame(b'N', severity, code, message),
            BackendMessage::RowDescription { fields } => {
                let mut body = BytesMut::new();
                body.put_i16(fields.len() as i16);
                for field in fields {
                    put_cstr(&mut body, &field.name);
                    body.put_u32(field.table_oid);
                    body.put_i16(field.column_attr);
                    body.put_u32(field.type_oid);
                    body.put_i16(field.type_len);
                    body.put_i32(field.type_modifier);
                    body.put_i16(field.format);
                }
                tagged_frame(b'T', &body)
            }
            BackendMessage::DataRow { values } => {
                let mut body = BytesMut::new();
                body.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        None => body.put_i32(-1),
                        Some(bytes) => {
                            body.put_i32(bytes.len() as i32);
                            body.put_slice(bytes);
                        }
                    }
                }
                tagged_frame(b'D', &body)
            }
            BackendMessage::CommandComplete { tag } => {
                let mut body = BytesMut::new();
                put_cstr(&mut body, tag);
                tagged_frame(b'C', &body)
            }
            BackendMessage::Opaque { tag, body } => {
                let mut buf = BytesMut::new();
                buf.put_slice(body);
                tagged_frame(*tag, &buf)
            }
        }
    }

    /// Decode a tagged backend frame body.
    pub fn decode(tag: u8, body: &[u8]) -> Result<Self> {
        let mut buf = body;
        let msg = match tag {
            b'R' => match get_u32(&mut buf)? {
                0 => BackendMessage::AuthenticationOk,
                3 => BackendMessage::AuthenticationCleartextPassword,
                5 => {
                    let salt = get_bytes(&mut buf, 4)?;
                    BackendMessage::AuthenticationMd5Password {
                        salt: [salt[0], salt[1], salt[2], salt[3]],
                    }
                }
                other => {
                    return Err(SpqrError::Protocol(format!(
                        "unsupported authentication request {}",
                        other
                    )))
                }
            },
            b'S' => BackendMessage::ParameterStatus {
                name: get_cstr(&mut buf)?,
                value: get_cstr(&mut buf)?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: get_u32(&mut buf)?,
                secret_key: get_u32(&mut buf)?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: get_bytes(&mut buf, 1)?[0],
            },
            b'E' => {
                let (severity, code, message) = decode_notice_fields(&mut buf)?;
                BackendMessage::ErrorResponse {
                    severity,
                    code,
                    message,
                }
            }
            b'N' => {
                let (severity, code, message) = decode_notice_fields(&mut buf)?;
                BackendMessage::NoticeResponse {
                    severity,
                    code,
                    message,
                }
            }
            b'T' => {
                let n = get_i16(&mut buf)?;
                let mut fields = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    fields.push(FieldDescription {
                        name: get_cstr(&mut buf)?,
                        table_oid: get_u32(&mut buf)?,
                        column_attr: get_i16(&mut buf)?,
                        type_oid: get_u32(&mut buf)?,
                        type_len: get_i16(&mut buf)?,
                        type_modifier: get_i32(&mut buf)?,
                        format: get_i16(&mut buf)?,
                    });
                }
                BackendMessage::RowDescription { fields }
            }
            b'D' => {
                let n = get_i16(&mut buf)?;
                let mut values = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n {
                    let len = get_i32(&mut buf)?;
                    if len < 0 {
                        values.push(None);
                    } else {
                        values.push(Some(get_bytes(&mut buf, len as usize)?));
                    }
                }
                BackendMessage::DataRow { values }
            }
            b'C' => BackendMessage::CommandComplete {
                tag: get_cstr(&mut buf)?,
            },
            _ => BackendMessage::Opaque {
                tag,
                body: body.to_vec(),
            },
        };
        Ok(msg)
    }
}

/// Read one tagged frame. `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<(u8, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    match stream.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 || len - 4 > MAX_FRAME_LEN {
        return Err(SpqrError::Protocol(format!("invalid frame length {}", len)));
    }

    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    Ok(Some((tag[0], body)))
}

/// Read one startup-phase frame body (no tag byte on the wire).
pub async fn read_startup_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 8 || len - 4 > MAX_FRAME_LEN {
        return Err(SpqrError::Protocol(format!(
            "invalid startup frame length {}",
            len
        )));
    }

    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Write a frontend message and flush.
pub async fn write_frontend<S>(stream: &mut S, msg: &FrontendMessage) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&msg.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Write a backend message and flush.
pub async fn write_backend<S>(stream: &mut S, msg: &BackendMessage) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&msg.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Re-frame a raw tag + body and write it without flushing.
pub async fn write_raw<S>(stream: &mut S, tag: u8, body: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push(tag);
    frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    Ok(())
}

fn tagged_frame(tag: u8, body: &BytesMut) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push(tag);
    frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

fn untagged_frame(body: &BytesMut) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

fn auth_frame(code: u32, salt: Option<&[u8; 4]>) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u32(code);
    if let Some(salt) = salt {
        body.put_slice(salt);
    }
    tagged_frame(b'R', &body)
}

fn notice_like_frame(tag: u8, severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    put_cstr(&mut body, severity);
    body.put_u8(b'C');
    put_cstr(&mut body, code);
    body.put_u8(b'M');
    put_cstr(&mut body, message);
    body.put_u8(0);
    tagged_frame(tag, &body)
}

fn decode_notice_fields(buf: &mut &[u8]) -> Result<(String, String, String)> {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    loop {
        let field = get_bytes(buf, 1)?[0];
        if field == 0 {
            break;
        }
        let value = get_cstr(buf)?;
        match field {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    Ok((severity, code, message))
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstr(buf: &mut &[u8]) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| SpqrError::Protocol("unterminated string".into()))?;
    let s = String::from_utf8_lossy(&buf[..end]).to_string();
    buf.advance(end + 1);
    Ok(s)
}

fn get_bytes(buf: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    if buf.len() < n {
        return Err(SpqrError::Protocol("truncated frame".into()));
    }
    let bytes = buf[..n].to_vec();
    buf.advance(n);
    Ok(bytes)
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(SpqrError::Protocol("truncated frame".into()));
    }
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.len() < 4 {
        return Err(SpqrError::Protocol("truncated frame".into()));
    }
    Ok(buf.get_i32())
}

fn get_i16(buf: &mut &[u8]) -> Result<i16> {
    if buf.len() < 2 {
        return Err(SpqrError::Protocol("truncated frame".into()));
    }
    Ok(buf.get_i16())
}
