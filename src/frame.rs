use core::fmt;

use alloc::string::String;
use bilge::prelude::*;

use crate::{Decode, Encode};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ETB: u8 = 0x17;
pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;

/// STX: 1, Recno: 1, CR: 1, End: 1, Checksum: 2, CR LF: 2
pub const FRAME_OVERHEAD: usize = 8;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Marker closing the text of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    /// ETB, more frames follow.
    Intermediate,
    /// ETX, last frame of the message.
    Last,
}

impl FrameEnd {
    pub fn value(&self) -> u8 {
        match self {
            FrameEnd::Intermediate => ETB,
            FrameEnd::Last => ETX,
        }
    }

    fn from_byte(byte: u8) -> Option<FrameEnd> {
        match byte {
            ETB => Some(FrameEnd::Intermediate),
            ETX => Some(FrameEnd::Last),
            _ => None,
        }
    }
}

/// Byte sum modulo 256, sent on the wire as two uppercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum(u8);

impl Checksum {
    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn ascii(&self) -> [u8; 2] {
        [
            HEX_DIGITS[(self.0 >> 4) as usize],
            HEX_DIGITS[(self.0 & 0x0F) as usize],
        ]
    }

    fn from_ascii(high: u8, low: u8) -> Option<Checksum> {
        let nibble = |c: u8| HEX_DIGITS.iter().position(|d| *d == c).map(|p| p as u8);
        Some(Checksum((nibble(high)? << 4) | nibble(low)?))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

/// Sum of every byte of `check`, modulo 256.
pub fn checksum(check: &[u8]) -> Checksum {
    checksum_parts(&[check])
}

/// Checksum of the concatenation of `parts`.
fn checksum_parts(parts: &[&[u8]]) -> Checksum {
    Checksum(
        parts
            .iter()
            .flat_map(|part| part.iter())
            .fold(0u8, |acc, b| acc.wrapping_add(*b)),
    )
}

/// Maps every byte onto the char with the same code point, so frame text
/// survives as a string no matter what the meter sends.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| *b as char).collect()
}

/// Broad class of a frame rejection. All of them get the same NAK on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidity {
    Grammar,
    Checksum,
    Sequence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    MissingStart,
    Truncated {
        expected_at_least: usize,
        found: usize,
    },
    BadRecordNumber {
        found: u8,
    },
    MissingCarriageReturn,
    BadEnd {
        found: u8,
    },
    BadChecksumDigits {
        found: [u8; 2],
    },
    MissingTrailer,
    /// Frame text holds a CR, which would end it early on the wire.
    CarriageReturnInText,
    ChecksumMismatch {
        calculated: Checksum,
        found: Checksum,
    },
    SequenceMismatch {
        expected: u3,
        found: u3,
    },
    EncodeBufferTooSmall {
        expected: usize,
        found: usize,
    },
}

impl FrameError {
    /// `None` for errors that are not about received bytes.
    pub fn invalidity(&self) -> Option<Invalidity> {
        match self {
            FrameError::ChecksumMismatch { .. } => Some(Invalidity::Checksum),
            FrameError::SequenceMismatch { .. } => Some(Invalidity::Sequence),
            FrameError::EncodeBufferTooSmall { .. } | FrameError::CarriageReturnInText => None,
            _ => Some(Invalidity::Grammar),
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::MissingStart => write!(f, "frame does not start with STX"),
            FrameError::Truncated {
                expected_at_least,
                found,
            } => write!(
                f,
                "frame truncated, expected at least {} bytes, found {}",
                expected_at_least, found
            ),
            FrameError::BadRecordNumber { found } => {
                write!(f, "record number byte {:#04x} is not 0-7", found)
            }
            FrameError::MissingCarriageReturn => write!(f, "frame text is not closed by CR"),
            FrameError::BadEnd { found } => {
                write!(f, "expected ETX or ETB after text, found {:#04x}", found)
            }
            FrameError::BadChecksumDigits { found } => write!(
                f,
                "checksum digits {:#04x} {:#04x} are not uppercase hex",
                found[0], found[1]
            ),
            FrameError::MissingTrailer => write!(f, "frame is not terminated by CR LF"),
            FrameError::CarriageReturnInText => write!(f, "frame text cannot carry CR"),
            FrameError::ChecksumMismatch { calculated, found } => write!(
                f,
                "checksum mismatch, calculated {} but frame carries {}",
                calculated, found
            ),
            FrameError::SequenceMismatch { expected, found } => write!(
                f,
                "expected record number {}, found {}",
                expected.value(),
                found.value()
            ),
            FrameError::EncodeBufferTooSmall { expected, found } => write!(
                f,
                "encode buffer holds {} bytes, frame needs {}",
                found, expected
            ),
        }
    }
}

/// One transport unit: `STX recno text CR end checksum CR LF`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    recno: u3,
    text: &'a [u8],
    end: FrameEnd,
    checksum: Checksum,
}

impl<'a> Frame<'a> {
    /// Fails if `text` contains CR, the receiver stops the text at the first one.
    pub fn new(recno: u3, text: &'a [u8], end: FrameEnd) -> Result<Frame<'a>, FrameError> {
        if text.contains(&CR) {
            return Err(FrameError::CarriageReturnInText);
        }
        let checksum = checksum_parts(&[&[recno_digit(recno)], text, &[CR, end.value()]]);
        Ok(Frame {
            recno,
            text,
            end,
            checksum,
        })
    }

    pub fn recno(&self) -> u3 {
        self.recno
    }

    pub fn text(&self) -> &'a [u8] {
        self.text
    }

    pub fn end(&self) -> FrameEnd {
        self.end
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Text as a string, one char per byte.
    pub fn payload(&self) -> String {
        latin1(self.text)
    }

    /// Length on the wire.
    pub fn size(&self) -> usize {
        self.text.len() + FRAME_OVERHEAD
    }
}

fn recno_digit(recno: u3) -> u8 {
    b'0' + recno.value()
}

impl<'a> Encode for Frame<'a> {
    type Error = FrameError;

    fn encode(&self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        if buffer.len() < self.size() {
            return Err(FrameError::EncodeBufferTooSmall {
                expected: self.size(),
                found: buffer.len(),
            });
        }
        let n = self.text.len();
        // STX: 1, RECNO: 1, TEXT: n, CR: 1, END: 1, CHECKSUM: 2, CR LF: 2
        //        |--------------CHECK-------------|
        buffer[0] = STX;
        buffer[1] = recno_digit(self.recno);
        buffer[2..n + 2].copy_from_slice(self.text);
        buffer[n + 2] = CR;
        buffer[n + 3] = self.end.value();
        buffer[n + 4..n + 6].copy_from_slice(&self.checksum.ascii());
        buffer[n + 6] = CR;
        buffer[n + 7] = LF;
        Ok(self.size())
    }
}

impl<'a> Decode<'a> for Frame<'a> {
    type Error = FrameError;

    /// Matches one frame at the start of `data`. Bytes after the closing
    /// CR LF are ignored.
    fn decode(data: &'a [u8]) -> Result<Self, Self::Error> {
        let truncated = |expected_at_least: usize| FrameError::Truncated {
            expected_at_least,
            found: data.len(),
        };
        match data.first() {
            Some(&STX) => {}
            Some(_) => return Err(FrameError::MissingStart),
            None => return Err(truncated(FRAME_OVERHEAD)),
        }
        let digit = *data.get(1).ok_or_else(|| truncated(FRAME_OVERHEAD))?;
        if !(b'0'..=b'7').contains(&digit) {
            return Err(FrameError::BadRecordNumber { found: digit });
        }
        let recno = u3::new(digit - b'0');

        let cr = data[2..]
            .iter()
            .position(|b| *b == CR)
            .ok_or(FrameError::MissingCarriageReturn)?
            + 2;
        let text = &data[2..cr];

        // END: 1, CHECKSUM: 2, CR LF: 2
        let tail = data
            .get(cr + 1..cr + 6)
            .ok_or_else(|| truncated(text.len() + FRAME_OVERHEAD))?;
        let end = FrameEnd::from_byte(tail[0]).ok_or(FrameError::BadEnd { found: tail[0] })?;
        let found = Checksum::from_ascii(tail[1], tail[2]).ok_or(FrameError::BadChecksumDigits {
            found: [tail[1], tail[2]],
        })?;
        if tail[3..] != [CR, LF] {
            return Err(FrameError::MissingTrailer);
        }

        // recno + text + CR + end
        let calculated = checksum(&data[1..cr + 2]);
        if calculated != found {
            return Err(FrameError::ChecksumMismatch { calculated, found });
        }

        Ok(Frame {
            recno,
            text,
            end,
            checksum: found,
        })
    }
}
