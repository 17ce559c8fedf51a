//! ASTM E1394 style records as sent by the meter.
//!
//! Every payload starts with a one character tag followed by fields split
//! on the field delimiter. Fields may in turn hold components and repeats.
//! The header record redefines the delimiters for the rest of the session.

use core::fmt;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use log::{debug, warn};

/// Action code in field 12 of an order record marking a control solution test.
const CONTROL_MARKER: &str = "Q";
/// Termination code in field 3 of a terminator record for a normal end.
const NORMAL_END: &str = "N";
/// Header fields before the trailing processing id, version and timestamp.
const HEADER_FIXED_FIELDS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub repeat: char,
    pub component: char,
    pub escape: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Delimiters {
            field: '|',
            repeat: '\\',
            component: '^',
            escape: '&',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Header,
    Patient,
    Order,
    Result,
    Terminator,
    Unknown(char),
}

impl RecordType {
    pub fn from_tag(tag: char) -> RecordType {
        match tag {
            'H' => RecordType::Header,
            'P' => RecordType::Patient,
            'O' => RecordType::Order,
            'R' => RecordType::Result,
            'L' => RecordType::Terminator,
            other => RecordType::Unknown(other),
        }
    }
}

/// Where the sample of a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Specimen {
    WholeBlood,
    Plasma,
    ControlSolution,
}

impl Specimen {
    pub fn from_code(code: &str) -> Option<Specimen> {
        match code {
            "B" => Some(Specimen::WholeBlood),
            "P" => Some(Specimen::Plasma),
            "C" => Some(Specimen::ControlSolution),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Specimen::WholeBlood => "whole blood",
            Specimen::Plasma => "plasma",
            Specimen::ControlSolution => "control solution",
        }
    }
}

/// Qualitative markers attached to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResultFlag {
    Low,
    High,
    BeforeFood,
    AfterFood,
    NotFeelingRight,
    Sick,
    Stress,
    Activity,
    Control,
    Marked,
    /// `M0` to `M3`, the meal marker set on the meter.
    NoMealMarker,
    Fasting,
    BeforeMeal,
    AfterMeal,
    /// `T0` to `T3`, how long after the meal the test was taken.
    NoMealTime,
    UnderOneHour,
    OneToTwoHours,
    OverTwoHours,
}

impl ResultFlag {
    pub fn from_code(code: &str) -> Option<ResultFlag> {
        let flag = match code {
            "<" => ResultFlag::Low,
            ">" => ResultFlag::High,
            "B" => ResultFlag::BeforeFood,
            "A" => ResultFlag::AfterFood,
            "D" => ResultFlag::NotFeelingRight,
            "I" => ResultFlag::Sick,
            "S" => ResultFlag::Stress,
            "X" => ResultFlag::Activity,
            "C" => ResultFlag::Control,
            "Z" => ResultFlag::Marked,
            "M0" => ResultFlag::NoMealMarker,
            "M1" => ResultFlag::Fasting,
            "M2" => ResultFlag::BeforeMeal,
            "M3" => ResultFlag::AfterMeal,
            "T0" => ResultFlag::NoMealTime,
            "T1" => ResultFlag::UnderOneHour,
            "T2" => ResultFlag::OneToTwoHours,
            "T3" => ResultFlag::OverTwoHours,
            _ => return None,
        };
        Some(flag)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ResultFlag::Low => "result low",
            ResultFlag::High => "result high",
            ResultFlag::BeforeFood => "before food",
            ResultFlag::AfterFood => "after food",
            ResultFlag::NotFeelingRight => "don't feel right",
            ResultFlag::Sick => "sick",
            ResultFlag::Stress => "stress",
            ResultFlag::Activity => "activity",
            ResultFlag::Control => "control solution",
            ResultFlag::Marked => "marked by user",
            ResultFlag::NoMealMarker => "no meal marker",
            ResultFlag::Fasting => "fasting",
            ResultFlag::BeforeMeal => "before meal",
            ResultFlag::AfterMeal => "after meal",
            ResultFlag::NoMealTime => "no time after meal",
            ResultFlag::UnderOneHour => "less than 1 hour after meal",
            ResultFlag::OneToTwoHours => "1 to 2 hours after meal",
            ResultFlag::OverTwoHours => "more than 2 hours after meal",
        }
    }
}

/// One test result, built from an order record and a result record sharing
/// the same index. Either may arrive first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurement {
    pub control: bool,
    pub kind: String,
    pub value: Option<f64>,
    pub unit: String,
    pub source: Option<Specimen>,
    pub flags: BTreeSet<ResultFlag>,
    pub timestamp: String,
}

/// Everything decoded during one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    pub delimiters: Delimiters,
    pub password: String,
    pub product: String,
    pub versions: Vec<String>,
    pub serial: String,
    pub sku: String,
    pub device_info: BTreeMap<String, String>,
    pub result_count: Option<u32>,
    pub processing_id: String,
    pub spec_version: String,
    pub header_timestamp: String,
    pub patient: Option<u32>,
    pub results: BTreeMap<u32, Measurement>,
    /// Result records that could not be decoded, by record index.
    pub rejected: BTreeMap<u32, RecordError>,
    /// Set by a terminator record with a normal termination code.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Header too short to carry the four delimiter characters.
    MissingDelimiters,
    MissingField {
        record: RecordType,
        position: usize,
    },
    BadInteger {
        record: RecordType,
        position: usize,
        found: String,
    },
    BadNumber {
        found: String,
    },
    UnknownSource(String),
    UnknownFlag(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::MissingDelimiters => write!(f, "header does not define delimiters"),
            RecordError::MissingField { record, position } => {
                write!(f, "{:?} record has no field {}", record, position)
            }
            RecordError::BadInteger {
                record,
                position,
                found,
            } => write!(
                f,
                "{:?} record field {} is not an integer: {:?}",
                record, position, found
            ),
            RecordError::BadNumber { found } => write!(f, "result value {:?} is not a number", found),
            RecordError::UnknownSource(code) => write!(f, "unknown specimen source {:?}", code),
            RecordError::UnknownFlag(code) => write!(f, "unknown result flag {:?}", code),
        }
    }
}

/// Fields of one record, split on the field delimiter.
struct Fields<'a> {
    record: RecordType,
    fields: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn split(record: RecordType, payload: &'a str, delimiters: &Delimiters) -> Fields<'a> {
        Fields {
            record,
            fields: payload.split(delimiters.field).collect(),
        }
    }

    /// Empty when the record stops short of `position`.
    fn get(&self, position: usize) -> &'a str {
        self.fields.get(position).copied().unwrap_or("")
    }

    fn integer(&self, position: usize) -> Result<u32, RecordError> {
        self.optional_integer(position)?
            .ok_or(RecordError::MissingField {
                record: self.record,
                position,
            })
    }

    fn optional_integer(&self, position: usize) -> Result<Option<u32>, RecordError> {
        let raw = self.get(position).trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(|_| RecordError::BadInteger {
            record: self.record,
            position,
            found: raw.to_string(),
        })
    }
}

/// Feeds record payloads into a [`RecordSet`].
#[derive(Debug, Default)]
pub struct RecordParser {
    records: RecordSet,
}

impl RecordParser {
    pub fn new() -> RecordParser {
        RecordParser::default()
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub fn into_records(self) -> RecordSet {
        self.records
    }

    /// Decode one record payload. Unknown record types are skipped.
    pub fn feed(&mut self, payload: &str) -> Result<(), RecordError> {
        let Some(tag) = payload.chars().next() else {
            return Ok(());
        };
        match RecordType::from_tag(tag) {
            RecordType::Header => self.header(payload),
            RecordType::Patient => self.patient(payload),
            RecordType::Order => self.order(payload),
            RecordType::Result => self.result(payload),
            RecordType::Terminator => {
                self.terminator(payload);
                Ok(())
            }
            RecordType::Unknown(tag) => {
                debug!("skipping record with tag {:?}", tag);
                Ok(())
            }
        }
    }

    fn fields<'a>(&self, record: RecordType, payload: &'a str) -> Fields<'a> {
        Fields::split(record, payload, &self.records.delimiters)
    }

    fn header(&mut self, payload: &str) -> Result<(), RecordError> {
        // The four characters after the tag define the delimiters
        let mut defined = payload.chars().skip(1);
        let (Some(field), Some(repeat), Some(component), Some(escape)) =
            (defined.next(), defined.next(), defined.next(), defined.next())
        else {
            return Err(RecordError::MissingDelimiters);
        };
        let delimiters = Delimiters {
            field,
            repeat,
            component,
            escape,
        };
        self.records.delimiters = delimiters;

        let fields = self.fields(RecordType::Header, payload);
        let records = &mut self.records;
        records.password = fields.get(3).to_string();

        let mut sender = fields.get(4).split(delimiters.component);
        records.product = sender.next().unwrap_or("").to_string();
        records.versions = sender
            .next()
            .unwrap_or("")
            .split(delimiters.repeat)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .collect();
        records.serial = sender.next().unwrap_or("").to_string();
        records.sku = sender.next().unwrap_or("").to_string();

        records.device_info = fields
            .get(5)
            .split(delimiters.component)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
                (key.to_string(), value.to_string())
            })
            .collect();
        records.result_count = fields.optional_integer(6)?;

        // Firmwares differ in how many reserved fields precede these, so
        // they are counted from the end of the record.
        let trailing = fields.fields.get(HEADER_FIXED_FIELDS..).unwrap_or(&[]);
        let from_end = |n: usize| {
            trailing
                .len()
                .checked_sub(n)
                .map(|i| trailing[i].to_string())
                .unwrap_or_default()
        };
        records.processing_id = from_end(3);
        records.spec_version = from_end(2);
        records.header_timestamp = from_end(1);

        debug!(
            "header from {} serial {} announcing {:?} results",
            records.product, records.serial, records.result_count
        );
        Ok(())
    }

    fn patient(&mut self, payload: &str) -> Result<(), RecordError> {
        let fields = self.fields(RecordType::Patient, payload);
        self.records.patient = Some(fields.integer(1)?);
        Ok(())
    }

    fn order(&mut self, payload: &str) -> Result<(), RecordError> {
        let fields = self.fields(RecordType::Order, payload);
        let index = fields.integer(1)?;
        let entry = self.records.results.entry(index).or_default();
        if fields.get(12) == CONTROL_MARKER {
            entry.control = true;
        }
        Ok(())
    }

    fn result(&mut self, payload: &str) -> Result<(), RecordError> {
        let fields = self.fields(RecordType::Result, payload);
        let index = fields.integer(1)?;
        let decoded = decode_result(&fields, &self.records.delimiters);
        let entry = self.records.results.entry(index).or_default();
        match decoded {
            Ok(measurement) => {
                *entry = Measurement {
                    control: entry.control,
                    ..measurement
                };
                self.records.rejected.remove(&index);
                Ok(())
            }
            Err(e) => {
                warn!("result {} rejected: {}", index, e);
                self.records.rejected.insert(index, e.clone());
                Err(e)
            }
        }
    }

    fn terminator(&mut self, payload: &str) {
        let fields = self.fields(RecordType::Terminator, payload);
        if fields.get(3) == NORMAL_END {
            self.records.complete = true;
        }
    }
}

fn decode_result(fields: &Fields<'_>, delimiters: &Delimiters) -> Result<Measurement, RecordError> {
    let kind = fields.get(2).split(delimiters.component).nth(3).unwrap_or("");

    let raw_value = fields.get(3).trim();
    let value = raw_value.parse::<f64>().map_err(|_| RecordError::BadNumber {
        found: raw_value.to_string(),
    })?;

    let mut units = fields.get(4).split(delimiters.component);
    let unit = units.next().unwrap_or("");
    let source = match units.next().unwrap_or("") {
        "" => None,
        code => Some(
            Specimen::from_code(code).ok_or_else(|| RecordError::UnknownSource(code.to_string()))?,
        ),
    };

    let flags = fields
        .get(6)
        .split(delimiters.repeat)
        .filter(|code| !code.is_empty())
        .map(|code| ResultFlag::from_code(code).ok_or_else(|| RecordError::UnknownFlag(code.to_string())))
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(Measurement {
        control: false,
        kind: kind.to_string(),
        value: Some(value),
        unit: unit.to_string(),
        source,
        flags,
        timestamp: fields.get(8).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate alloc;
    use alloc::vec;

    const HEADER: &str = "H|\\^&||uvmjq4|Bayer7390^01.20\\01.04\\04.02.19^7390-1163170\
        ^7396-|A=1^C=63^G=1^I=0200^R=0^S=1^U=1^V=10600^X=07007007009\
        9180135180248^Y=360126090050099050300089^Z=1|209||||||1|2011\
        02142249";

    const ORDER: &str = "O|1|||||||||||Q";
    const RESULT: &str = "R|1|^^^Glucose|93|mg/dL^P||B\\>||201108051611";

    fn parsed(payloads: &[&str]) -> RecordSet {
        let mut parser = RecordParser::new();
        for p in payloads {
            parser.feed(p).unwrap();
        }
        parser.into_records()
    }

    #[test]
    fn meter_header() {
        let records = parsed(&[HEADER]);
        assert_eq!(records.delimiters, Delimiters::default());
        assert_eq!(records.password, "uvmjq4");
        assert_eq!(records.product, "Bayer7390");
        assert_eq!(records.versions, vec!["01.20", "01.04", "04.02.19"]);
        assert_eq!(records.serial, "7390-1163170");
        assert_eq!(records.sku, "7396-");

        let expected: BTreeMap<String, String> = [
            ("A", "1"),
            ("C", "63"),
            ("G", "1"),
            ("I", "0200"),
            ("R", "0"),
            ("S", "1"),
            ("U", "1"),
            ("V", "10600"),
            ("X", "070070070099180135180248"),
            ("Y", "360126090050099050300089"),
            ("Z", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(records.device_info, expected);
        assert_eq!(records.result_count, Some(209));
        assert_eq!(records.processing_id, "");
        assert_eq!(records.spec_version, "1");
        assert_eq!(records.header_timestamp, "201102142249");
    }

    #[test]
    fn short_header() {
        let records = parsed(&["H|\\^&||pw|Prod^v1\\v2^serial^sku|k=v|209|||||1|ts"]);
        assert_eq!(records.product, "Prod");
        assert_eq!(records.versions, vec!["v1", "v2"]);
        assert_eq!(records.serial, "serial");
        assert_eq!(records.sku, "sku");
        assert_eq!(records.device_info.get("k").map(String::as_str), Some("v"));
        assert_eq!(records.result_count, Some(209));
        assert_eq!(records.processing_id, "");
        assert_eq!(records.spec_version, "1");
        assert_eq!(records.header_timestamp, "ts");
    }

    #[test]
    fn header_with_processing_id() {
        let records =
            parsed(&["H|\\^&||-7880|Bayer7150^1.05\\0.00^7150-SAM2193|||||||P|1|200305121635"]);
        assert_eq!(records.password, "-7880");
        assert_eq!(records.versions, vec!["1.05", "0.00"]);
        assert_eq!(records.result_count, None);
        assert_eq!(records.processing_id, "P");
        assert_eq!(records.spec_version, "1");
        assert_eq!(records.header_timestamp, "200305121635");
    }

    #[test]
    fn header_without_trailing_fields() {
        let records = parsed(&["H|\\^&"]);
        assert_eq!(records.product, "");
        assert!(records.versions.is_empty());
        assert!(records.device_info.is_empty());
        assert_eq!(records.processing_id, "");
        assert_eq!(records.header_timestamp, "");
    }

    #[test]
    fn header_too_short_for_delimiters() {
        let mut parser = RecordParser::new();
        assert_eq!(parser.feed("H|\\"), Err(RecordError::MissingDelimiters));
    }

    #[test]
    fn header_redefines_delimiters() {
        let records = parsed(&[
            "H!~@%!!pw!Prod@1.0~2.0@sn@sku",
            "R!4!@@@Glucose!5.5!mmol/L@B!!A~Z!!202001011200",
        ]);
        assert_eq!(
            records.delimiters,
            Delimiters {
                field: '!',
                repeat: '~',
                component: '@',
                escape: '%'
            }
        );
        assert_eq!(records.versions, vec!["1.0", "2.0"]);
        let m = &records.results[&4];
        assert_eq!(m.kind, "Glucose");
        assert_eq!(m.value, Some(5.5));
        assert_eq!(m.unit, "mmol/L");
        assert_eq!(m.source, Some(Specimen::WholeBlood));
        assert_eq!(
            m.flags.iter().copied().collect::<Vec<_>>(),
            vec![ResultFlag::AfterFood, ResultFlag::Marked]
        );
    }

    #[test]
    fn result_record() {
        let records = parsed(&[RESULT]);
        let m = &records.results[&1];
        assert!(!m.control);
        assert_eq!(m.kind, "Glucose");
        assert_eq!(m.value, Some(93.0));
        assert_eq!(m.unit, "mg/dL");
        assert_eq!(m.source.map(|s| s.description()), Some("plasma"));
        let flags: Vec<_> = m.flags.iter().map(|f| f.description()).collect();
        assert_eq!(flags, vec!["result high", "before food"]);
        assert_eq!(m.timestamp, "201108051611");
    }

    #[test]
    fn two_character_flags() {
        let records = parsed(&["R|1|^^^Glucose|105|mg/dL^P||A\\M0\\T1||201008301411"]);
        assert!(records.rejected.is_empty());
        let flags: Vec<_> = records.results[&1].flags.iter().copied().collect();
        assert_eq!(
            flags,
            vec![
                ResultFlag::AfterFood,
                ResultFlag::NoMealMarker,
                ResultFlag::UnderOneHour
            ]
        );
        assert_eq!(ResultFlag::from_code("M4"), None);
        assert_eq!(ResultFlag::from_code("T"), None);
    }

    #[test]
    fn order_and_result_merge_in_any_order() {
        let forward = parsed(&[ORDER, RESULT]);
        let reverse = parsed(&[RESULT, ORDER]);
        assert_eq!(forward.results.len(), 1);
        assert!(forward.results[&1].control);
        assert_eq!(forward.results[&1].value, Some(93.0));
        assert_eq!(forward.results, reverse.results);
    }

    #[test]
    fn order_without_marker_is_not_control() {
        let records = parsed(&["O|7"]);
        assert_eq!(records.results[&7], Measurement::default());
    }

    #[test]
    fn patient_record() {
        assert_eq!(parsed(&["P|1"]).patient, Some(1));
        let mut parser = RecordParser::new();
        assert!(matches!(
            parser.feed("P|x"),
            Err(RecordError::BadInteger { position: 1, .. })
        ));
    }

    #[test]
    fn terminator_completes_only_on_normal_end() {
        assert!(parsed(&["L|1||N"]).complete);
        assert!(!parsed(&["L|1||Q"]).complete);
        assert!(!parsed(&["L|1"]).complete);
    }

    #[test]
    fn unknown_records_are_ignored() {
        let records = parsed(&["C|1|comment", "Q|1", ""]);
        assert_eq!(records, RecordSet::default());
    }

    #[test]
    fn malformed_result_is_attached_to_its_index() {
        let mut parser = RecordParser::new();
        parser.feed("O|2|||||||||||Q").unwrap();
        assert_eq!(
            parser.feed("R|2|^^^Glucose|high|mg/dL^P||||201108051611"),
            Err(RecordError::BadNumber {
                found: "high".to_string()
            })
        );
        assert_eq!(
            parser.feed("R|3|^^^Glucose|90|mg/dL^Q||||201108051611"),
            Err(RecordError::UnknownSource("Q".to_string()))
        );
        assert_eq!(
            parser.feed("R|4|^^^Glucose|90|mg/dL^P||B\\W||201108051611"),
            Err(RecordError::UnknownFlag("W".to_string()))
        );
        parser.feed(RESULT).unwrap();

        let records = parser.into_records();
        assert_eq!(records.rejected.len(), 3);
        assert!(records.results[&2].control);
        assert_eq!(records.results[&2].value, None);
        assert_eq!(records.results[&1].value, Some(93.0));
    }

    #[test]
    fn result_needs_an_index() {
        let mut parser = RecordParser::new();
        assert_eq!(
            parser.feed("R||^^^Glucose|93"),
            Err(RecordError::MissingField {
                record: RecordType::Result,
                position: 1
            })
        );
        assert!(parser.records().results.is_empty());
    }
}
