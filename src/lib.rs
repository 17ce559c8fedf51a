//! Host side of the Bayer Contour USB meter link.
//!
//! [`Framer`] speaks the ENQ/ACK/EOT handshake and checks every frame the
//! meter sends. [`RecordParser`] turns the frame payloads, which are ASTM
//! E1394 records, into a [`RecordSet`]. [`download`] does both in one go.
#![no_std]

extern crate alloc;

mod astm;
mod config;
mod control;
mod frame;
mod link;
mod session;

pub trait Encode {
    type Error;

    /// Writes the wire form into `buffer`, returning how many bytes were used.
    fn encode(&self, buffer: &mut [u8]) -> Result<usize, Self::Error>;
}

pub trait Decode<'a> where Self: Sized {
    type Error;

    fn decode(data: &'a [u8]) -> Result<Self, Self::Error>;
}

pub use astm::{
    Delimiters, Measurement, RecordError, RecordParser, RecordSet, RecordType, ResultFlag,
    Specimen,
};
pub use config::LinkConfig;
pub use control::Control;
pub use frame::{Checksum, Frame, FrameEnd, FrameError, Invalidity, checksum, latin1};
pub use link::{CHUNK_CAPACITY, Framer, LinkError, LinkState, Payloads};
pub use session::{Download, download};

/// Three bit record number carried by every frame.
pub use bilge::prelude::u3;
