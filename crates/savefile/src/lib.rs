// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The save-file container format.
//!
//! A saved (or migrating) domain is carried as a fixed header, a
//! variable-length "optional data" block holding the textual domain
//! configuration, and then the platform's opaque state stream. The header
//! lets a reader detect a byte-order or feature mismatch, but not correct
//! it: all multi-byte integers are in the producing host's native order and
//! a mismatched order sentinel is always rejected, never swapped.

use std::io::{Read, Write};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

/// Identifies the file format. Exactly 32 bytes.
pub const SAVEFILE_MAGIC: &[u8; 32] = b"Domon saved domain, v1 format\0\n\r";

/// Fixed sentinel detecting byte-order mismatch between writer and reader.
pub const SAVEFILE_BYTEORDER_VALUE: u32 = 0x0102_0304;

/// The optional-data config sub-field is JSON rather than the legacy
/// text dialect.
pub const MANDATORY_FLAG_JSON: u32 = 1 << 0;
/// The state stream following the optional data is version 2.
pub const MANDATORY_FLAG_STREAM_V2: u32 = 1 << 1;

const MANDATORY_FLAG_ALL: u32 = MANDATORY_FLAG_JSON | MANDATORY_FLAG_STREAM_V2;

/// On-disk size of the fixed header.
pub const HEADER_LEN: usize = 48;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("save file has wrong magic number - corrupt or for a different tool?")]
    BadMagic,

    #[error("save file has wrong byte order (sentinel {0:#010x})")]
    WrongByteOrder(u32),

    #[error("save file has mandatory flag(s) {0:#x} which are not supported; need newer reader")]
    UnknownMandatoryFlags(u32),

    #[error("save file truncated")]
    Truncated,

    #[error("save file i/o error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The fixed header preceding a domain's state stream.
///
/// `mandatory_flags` encode wire-incompatible framing changes: a reader
/// must reject the stream on any bit it does not know. `optional_flags`
/// are advisory and may be ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub mandatory_flags: u32,
    pub optional_flags: u32,
    pub optional_data_len: u32,
}

impl Header {
    pub fn config_in_json(&self) -> bool {
        self.mandatory_flags & MANDATORY_FLAG_JSON != 0
    }

    /// State stream version selected by the v2 mandatory flag.
    pub fn stream_version(&self) -> u32 {
        if self.mandatory_flags & MANDATORY_FLAG_STREAM_V2 != 0 {
            2
        } else {
            1
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(SAVEFILE_MAGIC)?;
        w.write_u32::<NativeEndian>(SAVEFILE_BYTEORDER_VALUE)?;
        w.write_u32::<NativeEndian>(self.mandatory_flags)?;
        w.write_u32::<NativeEndian>(self.optional_flags)?;
        w.write_u32::<NativeEndian>(self.optional_data_len)?;
        Ok(())
    }

    /// Reads and validates the fixed header. Fails before any of the
    /// optional data is consumed.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Header> {
        let mut magic = [0u8; 32];
        r.read_exact(&mut magic)?;
        if &magic != SAVEFILE_MAGIC {
            return Err(Error::BadMagic);
        }

        let byteorder = r.read_u32::<NativeEndian>()?;
        if byteorder != SAVEFILE_BYTEORDER_VALUE {
            return Err(Error::WrongByteOrder(byteorder));
        }

        let hdr = Header {
            mandatory_flags: r.read_u32::<NativeEndian>()?,
            optional_flags: r.read_u32::<NativeEndian>()?,
            optional_data_len: r.read_u32::<NativeEndian>()?,
        };

        let badflags = hdr.mandatory_flags & !MANDATORY_FLAG_ALL;
        if badflags != 0 {
            return Err(Error::UnknownMandatoryFlags(badflags));
        }

        Ok(hdr)
    }
}

/// Append-only builder for the optional data region.
#[derive(Default)]
pub struct OptionalDataBuilder {
    buf: Vec<u8>,
}

impl OptionalDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the length-prefixed config sub-field.
    pub fn push_config(&mut self, config: &[u8]) {
        self.buf
            .write_u32::<NativeEndian>(config.len() as u32)
            .unwrap();
        self.buf.extend_from_slice(config);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Extracts the config sub-field from an optional-data block.
///
/// An empty block means no stored configuration. A sub-field claiming more
/// bytes than the block holds is a truncated stream.
pub fn parse_optional_data(optdata: &[u8]) -> Result<Option<Vec<u8>>> {
    if optdata.is_empty() {
        return Ok(None);
    }

    if optdata.len() < 4 {
        return Err(Error::Truncated);
    }
    let config_len = (&optdata[..4]).read_u32::<NativeEndian>()? as usize;

    let rest = &optdata[4..];
    if rest.len() < config_len {
        return Err(Error::Truncated);
    }

    Ok(Some(rest[..config_len].to_vec()))
}

/// Writes a complete header + optional data block ahead of a state stream.
///
/// The config bytes (if any) become the length-prefixed sub-field, and the
/// JSON mandatory flag is set for them when `config_in_json`. The stream
/// that follows is always declared v2.
pub fn write_save_header<W: Write>(
    w: &mut W,
    config: &[u8],
    config_in_json: bool,
) -> Result<Header> {
    let mut mandatory_flags = MANDATORY_FLAG_STREAM_V2;

    let mut optdata = OptionalDataBuilder::new();
    if !config.is_empty() {
        optdata.push_config(config);
        if config_in_json {
            mandatory_flags |= MANDATORY_FLAG_JSON;
        }
    }
    let optdata = optdata.finish();

    let hdr = Header {
        mandatory_flags,
        optional_flags: 0,
        optional_data_len: optdata.len() as u32,
    };

    hdr.write_to(w)?;
    w.write_all(&optdata)?;

    Ok(hdr)
}

/// Reads back a header and its stored configuration, leaving the reader
/// positioned at the start of the state stream.
pub fn read_save_header<R: Read>(r: &mut R) -> Result<(Header, Option<Vec<u8>>)> {
    let hdr = Header::read_from(r)?;

    let mut optdata = vec![0u8; hdr.optional_data_len as usize];
    r.read_exact(&mut optdata)?;

    let config = parse_optional_data(&optdata)?;

    Ok((hdr, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(hdr: &Header, optdata: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        buf.extend_from_slice(optdata);
        buf
    }

    #[test]
    fn test_header_round_trip() {
        let cases = [
            Header::default(),
            Header {
                mandatory_flags: MANDATORY_FLAG_STREAM_V2,
                optional_flags: 0,
                optional_data_len: 0,
            },
            Header {
                mandatory_flags: MANDATORY_FLAG_JSON | MANDATORY_FLAG_STREAM_V2,
                optional_flags: 0xdead_beef,
                optional_data_len: 4096,
            },
        ];

        for hdr in &cases {
            let mut buf = Vec::new();
            hdr.write_to(&mut buf).unwrap();
            assert_eq!(buf.len(), HEADER_LEN);

            let decoded = Header::read_from(&mut Cursor::new(&buf)).unwrap();
            assert_eq!(&decoded, hdr, "round trip of {:?}", hdr);
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let hdr = Header::default();
        let mut buf = encode(&hdr, &[]);
        buf[0] ^= 0xff;

        let err = Header::read_from(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(&err, Error::BadMagic), "got {:?}", err);
    }

    #[test]
    fn test_byte_order_mismatch_rejected() {
        let hdr = Header::default();
        let mut buf = encode(&hdr, &[]);
        // Swap the sentinel, as a foreign-order producer would have
        // written it.
        buf[32..36].reverse();

        let err = Header::read_from(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(&err, Error::WrongByteOrder(_)), "got {:?}", err);
    }

    #[test]
    fn test_unknown_mandatory_flags_rejected() {
        // Every bit outside the known mandatory set must cause rejection,
        // regardless of the optional flags.
        for bit in 2..32 {
            let hdr = Header {
                mandatory_flags: MANDATORY_FLAG_JSON | (1 << bit),
                optional_flags: 0xffff_ffff,
                optional_data_len: 0,
            };
            let buf = encode(&hdr, &[]);

            let err = Header::read_from(&mut Cursor::new(&buf)).unwrap_err();
            match err {
                Error::UnknownMandatoryFlags(bad) => assert_eq!(bad, 1 << bit),
                other => panic!("bit {}: got {:?}", bit, other),
            }
        }
    }

    #[test]
    fn test_unknown_mandatory_flag_stops_before_optional_data() {
        // Mandatory bit 2 is undefined: the reader must fail without
        // touching the declared optional-data block.
        let hdr = Header {
            mandatory_flags: 1 << 2,
            optional_flags: 0,
            optional_data_len: 11,
        };
        let buf = encode(&hdr, b"should not be read by anyone");

        let mut cursor = Cursor::new(&buf);
        let err = read_save_header(&mut cursor).unwrap_err();
        assert!(matches!(&err, Error::UnknownMandatoryFlags(_)), "got {:?}", err);
        assert_eq!(cursor.position() as usize, HEADER_LEN);
    }

    #[test]
    fn test_stored_json_config_scenario() {
        let config = b"{\"a\":1}\0";

        let mut buf = Vec::new();
        let hdr = write_save_header(&mut buf, config, true).unwrap();

        assert_eq!(
            hdr.mandatory_flags,
            MANDATORY_FLAG_JSON | MANDATORY_FLAG_STREAM_V2
        );
        // Length prefix plus the 8 config bytes, trailing NUL included.
        assert_eq!(hdr.optional_data_len, 12);

        let mut cursor = Cursor::new(&buf);
        let (decoded, stored) = read_save_header(&mut cursor).unwrap();
        assert!(decoded.config_in_json());
        assert_eq!(decoded.stream_version(), 2);
        assert_eq!(stored.as_deref(), Some(&config[..]));
        // Reader is left at the start of the state stream.
        assert_eq!(cursor.position() as usize, buf.len());
    }

    #[test]
    fn test_optional_data_truncation() {
        // Sub-field length prefix claims more bytes than the block holds.
        let mut optdata = Vec::new();
        optdata.write_u32::<NativeEndian>(100).unwrap();
        optdata.extend_from_slice(b"short");

        let err = parse_optional_data(&optdata).unwrap_err();
        assert!(matches!(&err, Error::Truncated), "got {:?}", err);

        // A block too small for the length prefix itself.
        let err = parse_optional_data(&[1, 2]).unwrap_err();
        assert!(matches!(&err, Error::Truncated), "got {:?}", err);

        // An empty block simply means no stored config.
        assert!(parse_optional_data(&[]).unwrap().is_none());
    }

    #[test]
    fn test_empty_config_omits_optional_data() {
        let mut buf = Vec::new();
        let hdr = write_save_header(&mut buf, b"", true).unwrap();

        assert_eq!(hdr.mandatory_flags, MANDATORY_FLAG_STREAM_V2);
        assert_eq!(hdr.optional_data_len, 0);
        assert_eq!(buf.len(), HEADER_LEN);

        let (_, stored) = read_save_header(&mut Cursor::new(&buf)).unwrap();
        assert!(stored.is_none());
    }
}
