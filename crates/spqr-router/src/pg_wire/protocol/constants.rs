//! PostgreSQL wire protocol constants

/// Protocol version 3.0
pub const PROTOCOL_VERSION: u32 = 196608;

/// Magic "version" carried by an SSLRequest frame
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Magic "version" carried by a CancelRequest frame
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Magic "version" carried by a GSSENCRequest frame
pub const GSSENC_REQUEST_CODE: u32 = 80877104;

/// Transaction status: idle (not in a transaction)
pub const TRANSACTION_STATUS_IDLE: u8 = b'I';

/// Transaction status: in a transaction block
pub const TRANSACTION_STATUS_IN_TRANSACTION: u8 = b'T';

/// Transaction status: in a failed transaction block
pub const TRANSACTION_STATUS_FAILED: u8 = b'E';

/// Largest frame body accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
