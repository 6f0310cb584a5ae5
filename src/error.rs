//! Parser-level error type.
//!
//! Distinct from [`crate::report::Finding`]: a [`ParseError`] means the bytes
//! themselves could not be decoded (truncated file, lost sync, bad CRC, box-size
//! disagreement) and aborts the *unit* being parsed. A conformance failure, by
//! contrast, means the bytes parsed fine but violate a DASH profile rule; those never
//! use this type, they go through [`crate::report::Report`] instead.

use std::fmt::{self, Debug, Formatter};
use std::result;

/// What went wrong while parsing a TS packet, PSI section, PES packet, or BMFF box.
#[derive(Debug, Clone)]
pub enum ErrorDetails {
    /// A read reached past the end of the buffer supplied to the reader.
    /// The `usize` is the length of the offending read.
    PacketOverrun(usize),
    /// A TS packet did not start with the 0x47 sync byte.
    LostSync,
    /// An adaptation field's declared length was inconsistent with its contents.
    BadAdaptationHeader,
    /// A PSI section's pointer field or header was inconsistent with the buffer.
    BadPsiHeader,
    /// A PSI section failed CRC-32/MPEG-2 verification.
    PsiCrcMismatch,
    /// A PES optional header was inconsistent with its declared length.
    BadPesHeader,
    /// A BMFF box declared a size inconsistent with what its body parser consumed.
    BadBoxSize,
    /// A BMFF box's body ran out of bytes before its fields were fully read.
    UnexpectedEof,
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDetails::PacketOverrun(len) => write!(f, "read of {} bytes overran buffer", len),
            ErrorDetails::LostSync => write!(f, "lost sync (expected 0x47)"),
            ErrorDetails::BadAdaptationHeader => write!(f, "malformed adaptation field"),
            ErrorDetails::BadPsiHeader => write!(f, "malformed PSI section header"),
            ErrorDetails::PsiCrcMismatch => write!(f, "PSI CRC-32 mismatch"),
            ErrorDetails::BadPesHeader => write!(f, "malformed PES optional header"),
            ErrorDetails::BadBoxSize => write!(f, "box size disagreed with parsed contents"),
            ErrorDetails::UnexpectedEof => write!(f, "box body ended before all fields were read"),
        }
    }
}

/// A located parse error: byte offset within the unit being parsed, plus [`ErrorDetails`].
#[derive(Clone)]
pub struct Error {
    /// Byte index within the buffer the error was encountered at.
    pub location: usize,
    /// What kind of parse error occurred.
    pub details: ErrorDetails,
}

impl Error {
    pub(crate) fn new(location: usize, details: ErrorDetails) -> Self {
        Self { location, details }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.details, self.location)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}

/// [`std::result::Result`] alias that uses this crate's [`Error`].
pub type Result<T> = result::Result<T, Error>;
