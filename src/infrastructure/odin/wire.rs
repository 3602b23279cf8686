//! Odin wire frames
//!
//! Requests are fixed 1024-byte little-endian records; responses are 8
//! bytes. Serialization is explicit so the layout holds on any host.

/// Request frame size on the wire.
pub const REQUEST_LEN: usize = 1024;
/// Response frame size on the wire.
pub const RESPONSE_LEN: usize = 8;

pub const DATA_INT_COUNT: usize = 9;
pub const DATA_CHAR_LEN: usize = 128;
pub const MD5_LEN: usize = 32;

/// Command verbs (the request `id`).
pub mod cmd {
    pub const INIT: i32 = 100;
    pub const PIT: i32 = 101;
    pub const XMIT: i32 = 102;
    pub const CLOSE: i32 = 103;
    /// Per-packet data acknowledgements come back under this id.
    pub const EMPTY: i32 = 0;
}

/// Parameters for `cmd::INIT`.
pub mod init {
    pub const TARGET: i32 = 0;
    pub const TOTALSIZE: i32 = 2;
    pub const PACKETSIZE: i32 = 5;
}

/// Parameters for `cmd::PIT`.
pub mod pit {
    pub const SET: i32 = 0;
    pub const GET: i32 = 1;
    pub const START: i32 = 2;
    pub const COMPLETE: i32 = 3;
}

/// Parameters for `cmd::XMIT`.
pub mod xmit {
    pub const DOWNLOAD: i32 = 0;
    pub const START: i32 = 2;
    pub const COMPLETE: i32 = 3;
    pub const COMPRESSED_DOWNLOAD: i32 = 5;
    pub const COMPRESSED_START: i32 = 6;
    pub const COMPRESSED_COMPLETE: i32 = 7;
}

/// Parameters for `cmd::CLOSE`.
pub mod close {
    pub const END: i32 = 0;
    pub const REBOOT: i32 = 1;
    pub const REDOWNLOAD: i32 = 4;
}

/// One request frame.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: i32,
    pub param: i32,
    pub int_data: [i32; DATA_INT_COUNT],
    pub char_data: [u8; DATA_CHAR_LEN],
    pub md5: [u8; MD5_LEN],
}

impl Request {
    pub fn new(id: i32, param: i32, ints: &[i32]) -> Request {
        let mut int_data = [0i32; DATA_INT_COUNT];
        let n = ints.len().min(DATA_INT_COUNT);
        int_data[..n].copy_from_slice(&ints[..n]);
        Request {
            id,
            param,
            int_data,
            char_data: [0; DATA_CHAR_LEN],
            md5: [0; MD5_LEN],
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut out = [0u8; REQUEST_LEN];
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.param.to_le_bytes());
        for (i, v) in self.int_data.iter().enumerate() {
            let off = 8 + i * 4;
            out[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
        let chars_off = 8 + DATA_INT_COUNT * 4;
        out[chars_off..chars_off + DATA_CHAR_LEN].copy_from_slice(&self.char_data);
        let md5_off = chars_off + DATA_CHAR_LEN;
        out[md5_off..md5_off + MD5_LEN].copy_from_slice(&self.md5);
        out
    }

    /// Decode the prefix of a request frame (device-side; tests).
    pub fn decode(bytes: &[u8; REQUEST_LEN]) -> Request {
        let mut r = Request::new(
            i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            &[],
        );
        for i in 0..DATA_INT_COUNT {
            let off = 8 + i * 4;
            r.int_data[i] = i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        }
        let chars_off = 8 + DATA_INT_COUNT * 4;
        r.char_data
            .copy_from_slice(&bytes[chars_off..chars_off + DATA_CHAR_LEN]);
        let md5_off = chars_off + DATA_CHAR_LEN;
        r.md5.copy_from_slice(&bytes[md5_off..md5_off + MD5_LEN]);
        r
    }
}

/// One response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub id: i32,
    pub ack: i32,
}

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut out = [0u8; RESPONSE_LEN];
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.ack.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; RESPONSE_LEN]) -> Response {
        Response {
            id: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            ack: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_exactly_1024_little_endian() {
        let r = Request::new(cmd::INIT, init::TARGET, &[5, -2]);
        let bytes = r.encode();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[0..4], &[100, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[5, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[0xFE, 0xFF, 0xFF, 0xFF]);
        // Padding after md5 stays zero.
        assert!(bytes[8 + 36 + 128 + 32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn request_round_trip() {
        let mut r = Request::new(cmd::XMIT, xmit::COMPLETE, &[0, 1, 2, 3, 4, 5, 6, 7]);
        r.char_data[0] = b'x';
        let d = Request::decode(&r.encode());
        assert_eq!(d.id, r.id);
        assert_eq!(d.param, r.param);
        assert_eq!(d.int_data, r.int_data);
        assert_eq!(d.char_data[0], b'x');
    }

    #[test]
    fn response_is_exactly_8_little_endian() {
        let r = Response { id: cmd::PIT, ack: 0x1234 };
        let bytes = r.encode();
        assert_eq!(bytes, [101, 0, 0, 0, 0x34, 0x12, 0, 0]);
        assert_eq!(Response::decode(&bytes), r);
    }
}
