use alloc::vec::Vec;
use embedded_io::{Read, Write};
use log::{info, warn};

use crate::{
    astm::{RecordError, RecordParser, RecordSet},
    link::{Framer, LinkError},
};

/// Outcome of reading the meter's memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub records: RecordSet,
    /// Records that failed to decode, in arrival order. Result records
    /// also show up in [`RecordSet::rejected`] under their index.
    pub failures: Vec<RecordError>,
}

/// Run one sync and decode every payload the meter sends.
///
/// A record that fails to decode is kept aside and the download goes on.
/// Link errors end the download.
pub fn download<C>(framer: &mut Framer<C>) -> Result<Download, LinkError<C::Error>>
where
    C: Read + Write,
{
    let mut parser = RecordParser::new();
    let mut failures = Vec::new();
    for payload in framer.sync() {
        let payload = payload?;
        if let Err(e) = parser.feed(&payload) {
            warn!("could not decode {:?}: {}", payload, e);
            failures.push(e);
        }
    }
    let records = parser.into_records();
    info!(
        "downloaded {} results from {}, complete: {}",
        records.results.len(),
        records.serial,
        records.complete
    );
    Ok(Download { records, failures })
}
