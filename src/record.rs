//! The tagged record: the wire language between client and server.
//!
//! A record is an ordered, heterogeneous sequence of fields, each preceded
//! by a one-byte type tag. This is PulseAudio's "tagstruct" concept, ported
//! from `pulsecore/tagstruct.c` to operate over an owned, detachable buffer
//! instead of a streaming `BufRead`.
//!
//! Two storage strategies exist for the same field grammar:
//!
//! - [`Record::new`] produces an *appended* record: writes go into a small
//!   inline array first, and only spill onto the heap once
//!   [`MAX_APPENDED_SIZE`] is exceeded.
//! - [`Record::from_bytes`] produces a *fixed-view* record: a read-only
//!   cursor over an externally owned byte slice, with no allocation.
//!
//! Both are read with the same `get_*` methods and can be [`Record::copy`]'d
//! into an independent, heap-detached record.

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

use crate::sample_spec::{SampleFormat, SampleSpec};

/// Inline capacity of an appended record before writes spill to the heap.
///
/// Chosen to match `pulsecore/tagstruct.c`'s `MAX_APPENDED_SIZE`; the codec
/// boundary tests below write fields that cross this threshold.
pub const MAX_APPENDED_SIZE: usize = 128;

/// A single-byte wire discriminator for one field in a [`Record`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Tag {
    /// NUL-terminated UTF-8 string.
    String = b't',
    /// The "no string" sentinel (used where a string field is optional).
    StringNull = b'N',
    /// Big-endian `u32`.
    U32 = b'L',
    /// A single byte.
    U8 = b'B',
    /// Big-endian `u64`.
    U64 = b'R',
    /// Big-endian `i32`.
    S32 = b's',
    /// 4-byte big-endian length prefix followed by raw bytes.
    Arbitrary = b'x',
    /// `{ encoding: u8, channels: u8, rate: u32-BE }`.
    SampleSpec = b'a',
}

impl Tag {
    fn from_u8(b: u8) -> Option<Tag> {
        Some(match b {
            b't' => Tag::String,
            b'N' => Tag::StringNull,
            b'L' => Tag::U32,
            b'B' => Tag::U8,
            b'R' => Tag::U64,
            b's' => Tag::S32,
            b'x' => Tag::Arbitrary,
            b'a' => Tag::SampleSpec,
            _ => return None,
        })
    }
}

/// An error produced while reading a [`Record`].
///
/// A get operation only advances the cursor on success; on error the cursor
/// is left exactly where it was.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The cursor ran past the logical end of the record.
    #[error("unexpected end of record")]
    UnexpectedEof,
    /// The byte at the cursor was not a recognized tag.
    #[error("invalid tag byte 0x{0:02x}")]
    InvalidTag(u8),
    /// The tag at the cursor didn't match what the caller expected.
    #[error("expected tag {expected:?}, found {found:?}")]
    TagMismatch {
        /// The tag the caller asked for.
        expected: Tag,
        /// The tag actually found at the cursor.
        found: Tag,
    },
    /// A string field's bytes weren't valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    /// An `eof()` assertion failed: bytes remained after parsing arguments.
    #[error("trailing data in record")]
    TrailingData,
}

enum Storage<'a> {
    Owned {
        inline: [u8; MAX_APPENDED_SIZE],
        inline_len: usize,
        spill: Vec<u8>,
    },
    Fixed(&'a [u8]),
}

impl<'a> Storage<'a> {
    fn len(&self) -> usize {
        match self {
            Storage::Owned {
                inline_len, spill, ..
            } => inline_len + spill.len(),
            Storage::Fixed(b) => b.len(),
        }
    }

    fn byte(&self, i: usize) -> u8 {
        match self {
            Storage::Owned {
                inline,
                inline_len,
                spill,
            } => {
                if i < *inline_len {
                    inline[i]
                } else {
                    spill[i - inline_len]
                }
            }
            Storage::Fixed(b) => b[i],
        }
    }

    fn push_slice(&mut self, bytes: &[u8]) {
        match self {
            Storage::Owned {
                inline,
                inline_len,
                spill,
            } => {
                for &b in bytes {
                    if *inline_len < MAX_APPENDED_SIZE {
                        inline[*inline_len] = b;
                        *inline_len += 1;
                    } else {
                        spill.push(b);
                    }
                }
            }
            Storage::Fixed(_) => panic!("cannot append to a fixed-view record"),
        }
    }

    fn copy_range(&self, start: usize, len: usize) -> Vec<u8> {
        (start..start + len).map(|i| self.byte(i)).collect()
    }
}

/// A tagged record: an ordered sequence of type-tagged fields with a
/// read cursor.
pub struct Record<'a> {
    storage: Storage<'a>,
    pos: usize,
}

impl<'a> Record<'a> {
    /// Creates an empty, growable record ready for writing.
    pub fn new() -> Record<'static> {
        Record {
            storage: Storage::Owned {
                inline: [0u8; MAX_APPENDED_SIZE],
                inline_len: 0,
                spill: Vec::new(),
            },
            pos: 0,
        }
    }

    /// Creates a read-only record viewing an externally owned byte slice.
    ///
    /// No bytes are copied; the returned record borrows `bytes`.
    pub fn from_bytes(bytes: &'a [u8]) -> Record<'a> {
        Record {
            storage: Storage::Fixed(bytes),
            pos: 0,
        }
    }

    /// Produces an independent record whose backing storage does not alias
    /// `self`'s. Always returns an owned (appended) record, even when
    /// copying a fixed-view.
    ///
    /// After this call, mutating or freeing the source's backing bytes
    /// must not affect the copy.
    pub fn copy(&self) -> Record<'static> {
        let bytes = self.storage.copy_range(0, self.storage.len());
        let mut out = Record::new();
        out.storage.push_slice(&bytes);
        out
    }

    /// True iff the read cursor is at the logical end of the record.
    pub fn eof(&self) -> bool {
        self.pos >= self.storage.len()
    }

    /// Returns [`RecordError::TrailingData`] if the cursor is not at the
    /// end. Handlers call this after parsing all expected arguments.
    pub fn expect_eof(&self) -> Result<(), RecordError> {
        if self.eof() {
            Ok(())
        } else {
            Err(RecordError::TrailingData)
        }
    }

    /// Total encoded length of the record, in bytes.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// True iff the record has no fields at all.
    pub fn is_empty(&self) -> bool {
        self.storage.len() == 0
    }

    /// Returns the fully encoded bytes of this record.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.storage.copy_range(0, self.storage.len())
    }

    fn peek_byte(&self) -> Result<u8, RecordError> {
        if self.pos >= self.storage.len() {
            Err(RecordError::UnexpectedEof)
        } else {
            Ok(self.storage.byte(self.pos))
        }
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, RecordError> {
        if self.pos + n > self.storage.len() {
            return Err(RecordError::UnexpectedEof);
        }
        let out = self.storage.copy_range(self.pos, n);
        self.pos += n;
        Ok(out)
    }

    fn read_tag(&mut self) -> Result<Tag, RecordError> {
        let b = self.peek_byte()?;
        let tag = Tag::from_u8(b).ok_or(RecordError::InvalidTag(b))?;
        self.pos += 1;
        Ok(tag)
    }

    fn expect_tag(&mut self, expected: Tag) -> Result<(), RecordError> {
        let start = self.pos;
        let found = self.read_tag()?;
        if found == expected {
            Ok(())
        } else {
            self.pos = start;
            Err(RecordError::TagMismatch { expected, found })
        }
    }

    /// Appends a `u8` field.
    pub fn put_u8(&mut self, value: u8) {
        self.storage.push_slice(&[Tag::U8 as u8, value]);
    }

    /// Reads a `u8` field, failing if the tag doesn't match.
    pub fn get_u8(&mut self) -> Result<u8, RecordError> {
        let start = self.pos;
        self.expect_tag(Tag::U8)?;
        match self.read_bytes(1) {
            Ok(b) => Ok(b[0]),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Appends a `u32` field.
    pub fn put_u32(&mut self, value: u32) {
        let mut buf = [0u8; 5];
        buf[0] = Tag::U32 as u8;
        NetworkEndian::write_u32(&mut buf[1..], value);
        self.storage.push_slice(&buf);
    }

    /// Reads a `u32` field.
    pub fn get_u32(&mut self) -> Result<u32, RecordError> {
        let start = self.pos;
        self.expect_tag(Tag::U32)?;
        match self.read_bytes(4) {
            Ok(b) => Ok(NetworkEndian::read_u32(&b)),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Appends a `u64` field.
    pub fn put_u64(&mut self, value: u64) {
        let mut buf = [0u8; 9];
        buf[0] = Tag::U64 as u8;
        NetworkEndian::write_u64(&mut buf[1..], value);
        self.storage.push_slice(&buf);
    }

    /// Reads a `u64` field.
    pub fn get_u64(&mut self) -> Result<u64, RecordError> {
        let start = self.pos;
        self.expect_tag(Tag::U64)?;
        match self.read_bytes(8) {
            Ok(b) => Ok(NetworkEndian::read_u64(&b)),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Appends an `s32` field.
    pub fn put_s32(&mut self, value: i32) {
        let mut buf = [0u8; 5];
        buf[0] = Tag::S32 as u8;
        NetworkEndian::write_i32(&mut buf[1..], value);
        self.storage.push_slice(&buf);
    }

    /// Reads an `s32` field.
    pub fn get_s32(&mut self) -> Result<i32, RecordError> {
        let start = self.pos;
        self.expect_tag(Tag::S32)?;
        match self.read_bytes(4) {
            Ok(b) => Ok(NetworkEndian::read_i32(&b)),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Appends a NUL-terminated UTF-8 string field.
    pub fn put_string(&mut self, value: &str) {
        self.storage.push_slice(&[Tag::String as u8]);
        self.storage.push_slice(value.as_bytes());
        self.storage.push_slice(&[0u8]);
    }

    /// Reads a NUL-terminated string field.
    pub fn get_string(&mut self) -> Result<String, RecordError> {
        let start = self.pos;
        self.expect_tag(Tag::String)?;

        let mut bytes = Vec::new();
        loop {
            let b = match self.read_bytes(1) {
                Ok(b) => b[0],
                Err(e) => {
                    self.pos = start;
                    return Err(e);
                }
            };
            if b == 0 {
                break;
            }
            bytes.push(b);
        }

        String::from_utf8(bytes).map_err(|_| {
            self.pos = start;
            RecordError::InvalidUtf8
        })
    }

    /// Appends the "no string" sentinel, in place of an optional string
    /// field that has no value.
    pub fn put_string_null(&mut self) {
        self.storage.push_slice(&[Tag::StringNull as u8]);
    }

    /// Reads the "no string" sentinel, failing if the tag doesn't match.
    pub fn get_string_null(&mut self) -> Result<(), RecordError> {
        self.expect_tag(Tag::StringNull)
    }

    /// Appends an optional string: `Some` as [`Self::put_string`], `None`
    /// as [`Self::put_string_null`].
    pub fn put_string_opt(&mut self, value: Option<&str>) {
        match value {
            Some(s) => self.put_string(s),
            None => self.put_string_null(),
        }
    }

    /// Reads a field written by [`Self::put_string_opt`].
    pub fn get_string_opt(&mut self) -> Result<Option<String>, RecordError> {
        match self.peek_byte().ok().and_then(Tag::from_u8) {
            Some(Tag::StringNull) => {
                self.get_string_null()?;
                Ok(None)
            }
            _ => self.get_string().map(Some),
        }
    }

    /// Appends a length-prefixed raw byte array.
    pub fn put_arbitrary(&mut self, bytes: &[u8]) {
        self.storage.push_slice(&[Tag::Arbitrary as u8]);
        let mut len_buf = [0u8; 4];
        NetworkEndian::write_u32(&mut len_buf, bytes.len() as u32);
        self.storage.push_slice(&len_buf);
        self.storage.push_slice(bytes);
    }

    /// Reads a length-prefixed raw byte array.
    pub fn get_arbitrary(&mut self) -> Result<Vec<u8>, RecordError> {
        let start = self.pos;
        self.expect_tag(Tag::Arbitrary)?;
        let len = match self.read_bytes(4) {
            Ok(b) => NetworkEndian::read_u32(&b) as usize,
            Err(e) => {
                self.pos = start;
                return Err(e);
            }
        };
        match self.read_bytes(len) {
            Ok(b) => Ok(b),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Reads a length-prefixed raw byte array that must be exactly
    /// `expected_len` bytes, as used by [`crate::command::Command::Auth`].
    pub fn get_arbitrary_exact(&mut self, expected_len: usize) -> Result<Vec<u8>, RecordError> {
        let bytes = self.get_arbitrary()?;
        if bytes.len() != expected_len {
            return Err(RecordError::UnexpectedEof);
        }
        Ok(bytes)
    }

    /// Appends a sample-spec field.
    pub fn put_sample_spec(&mut self, ss: &SampleSpec) {
        self.storage.push_slice(&[Tag::SampleSpec as u8]);
        let mut buf = [0u8; 6];
        buf[0] = ss.format as u8;
        buf[1] = ss.channels;
        NetworkEndian::write_u32(&mut buf[2..], ss.rate);
        self.storage.push_slice(&buf);
    }

    /// Reads a sample-spec field.
    pub fn get_sample_spec(&mut self) -> Result<SampleSpec, RecordError> {
        let start = self.pos;
        self.expect_tag(Tag::SampleSpec)?;
        let b = match self.read_bytes(6) {
            Ok(b) => b,
            Err(e) => {
                self.pos = start;
                return Err(e);
            }
        };

        let format = SampleFormat::from_u8(b[0]).ok_or_else(|| {
            self.pos = start;
            RecordError::InvalidTag(b[0])
        })?;

        Ok(SampleSpec {
            format,
            channels: b[1],
            rate: NetworkEndian::read_u32(&b[2..]),
        })
    }
}

/// Allows matching an unvalidated byte against [`SampleFormat`] variants,
/// without depending on `num_traits` for this one small enum.
trait FromU8Lenient: Sized {
    fn from_u8(b: u8) -> Option<Self>;
}

impl FromU8Lenient for SampleFormat {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => SampleFormat::U8,
            1 => SampleFormat::Alaw,
            2 => SampleFormat::Ulaw,
            3 => SampleFormat::S16Le,
            4 => SampleFormat::S16Be,
            5 => SampleFormat::Float32Le,
            6 => SampleFormat::Float32Be,
            7 => SampleFormat::S32Le,
            8 => SampleFormat::S32Be,
            _ => return None,
        })
    }
}

impl Default for Record<'static> {
    fn default() -> Self {
        Record::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_mixed_fields() {
        let mut r = Record::new();
        r.put_u8(42);
        r.put_u32(0xdead_beef);
        r.put_u64(0x1122_3344_5566_7788);
        r.put_s32(-17);
        r.put_string("hello");
        r.put_arbitrary(&[1, 2, 3, 4]);
        r.put_sample_spec(&SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        });

        assert_eq!(r.get_u8().unwrap(), 42);
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_u64().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(r.get_s32().unwrap(), -17);
        assert_eq!(r.get_string().unwrap(), "hello");
        assert_eq!(r.get_arbitrary().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            r.get_sample_spec().unwrap(),
            SampleSpec {
                format: SampleFormat::S16Le,
                channels: 2,
                rate: 44100,
            }
        );
        assert!(r.eof());
    }

    #[test]
    fn copy_is_independent_of_source() {
        let mut orig = Record::new();
        for i in 0..10u8 {
            orig.put_u8(i);
        }
        orig.put_string("tail");

        let mut copy = orig.copy();

        // Mutate the source's cursor and drop it; the copy must still work.
        drop(orig);

        for i in 0..10u8 {
            assert_eq!(copy.get_u8().unwrap(), i);
        }
        assert_eq!(copy.get_string().unwrap(), "tail");
        assert!(copy.eof());
    }

    fn copy_boundary_case(nbytes: u8) {
        let mut orig = Record::new();
        for i in 0..nbytes {
            orig.put_u8(i);
        }
        orig.put_string("ABCDEF");

        let copy = orig.copy();

        // Zero out the original's storage to simulate the source being
        // freed; the copy must not reference it.
        let mut orig = orig;
        orig = Record::new();
        let _ = &orig;

        let mut copy = copy;
        for i in 0..nbytes {
            assert_eq!(copy.get_u8().unwrap(), i);
        }
        assert_eq!(copy.get_string().unwrap(), "ABCDEF");
        assert!(copy.eof());
    }

    #[test]
    fn copy_boundary_below_appended_threshold() {
        // 60 u8 entries * 2 bytes/entry = 120 bytes, under MAX_APPENDED_SIZE.
        copy_boundary_case(60);
    }

    #[test]
    fn copy_boundary_above_appended_threshold() {
        // 120 u8 entries * 2 bytes/entry = 240 bytes, spills onto the heap.
        copy_boundary_case(120);
    }

    #[test]
    fn fixed_view_copy_survives_source_mutation() {
        let count = 50u8;
        let mut raw = Vec::new();
        for i in 0..count {
            raw.push(Tag::U8 as u8);
            raw.push(i.wrapping_mul(2));
        }

        let mut backing = raw;
        let fixed = Record::from_bytes(&backing);
        let mut copy = fixed.copy();

        // Zero the backing bytes the fixed-view record pointed at.
        for b in backing.iter_mut() {
            *b = 0;
        }

        for i in 0..count {
            assert_eq!(copy.get_u8().unwrap(), i.wrapping_mul(2));
        }
        assert!(copy.eof());
    }

    #[test]
    fn tag_mismatch_leaves_cursor_unchanged() {
        let mut r = Record::new();
        r.put_u8(7);

        let err = r.get_u32().unwrap_err();
        assert_eq!(
            err,
            RecordError::TagMismatch {
                expected: Tag::U32,
                found: Tag::U8,
            }
        );

        // Cursor must not have advanced; u8 read still succeeds.
        assert_eq!(r.get_u8().unwrap(), 7);
        assert!(r.eof());
    }

    #[test]
    fn string_null_round_trips() {
        let mut r = Record::new();
        r.put_string_null();

        let mut parsed = Record::from_bytes(&r.as_bytes());
        parsed.get_string_null().unwrap();
        assert!(parsed.eof());
    }

    #[test]
    fn string_opt_round_trips_both_variants() {
        let mut r = Record::new();
        r.put_string_opt(Some("hello"));
        r.put_string_opt(None);

        let mut parsed = Record::from_bytes(&r.as_bytes());
        assert_eq!(parsed.get_string_opt().unwrap(), Some("hello".to_string()));
        assert_eq!(parsed.get_string_opt().unwrap(), None);
        assert!(parsed.eof());
    }

    #[test]
    fn get_string_null_rejects_a_real_string() {
        let mut r = Record::new();
        r.put_string("not null");

        let err = r.get_string_null().unwrap_err();
        assert_eq!(
            err,
            RecordError::TagMismatch {
                expected: Tag::StringNull,
                found: Tag::String,
            }
        );
    }

    #[test]
    fn eof_detects_trailing_data() {
        let mut r = Record::new();
        r.put_u8(1);
        r.put_u8(2);

        let _ = r.get_u8().unwrap();
        assert!(!r.eof());
        assert!(r.expect_eof().is_err());
    }

    #[test]
    fn empty_record_get_is_eof_error() {
        let mut r = Record::new();
        assert_eq!(r.get_u8().unwrap_err(), RecordError::UnexpectedEof);
    }
}
