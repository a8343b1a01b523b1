use serde::{Deserialize, Serialize};

use super::buffer::SampleBuffer;
use super::constants::WD_HEX_PREFIX;
use super::error::DecodeError;
use super::field::{FieldId, FieldTable};
use super::format::{Decoder, Format};
use super::store::Value;

const RECORD_LENGTH: &str = "record_length";
const EVENT_NUMBER: &str = "event_number";
const TRIGGER_TIME_STAMP: &str = "trigger_time_stamp";

/// A header line of a text event: the field it fills and the label that introduces it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextField {
    pub name: String,
    pub label: String,
}

impl TextField {
    fn new(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
        }
    }
}

/// Ordered header lines of a text event.
///
/// The first line marks the start of an event; samples follow the line of the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextStructure {
    pub fields: Vec<TextField>,
}

impl TextStructure {
    /// Layout written by WaveDump for the x725/x730 families
    pub fn wavedump() -> Self {
        Self {
            fields: vec![
                TextField::new(RECORD_LENGTH, "Record Length:"),
                TextField::new("board_id", "BoardID:"),
                TextField::new("channel", "Channel:"),
                TextField::new(EVENT_NUMBER, "Event Number:"),
                TextField::new("pattern", "Pattern:"),
                TextField::new(TRIGGER_TIME_STAMP, "Trigger Time Stamp:"),
                TextField::new("dc_offset", "DC offset (DAC):"),
            ],
        }
    }

    /// Layout written by WaveDump for the x742 family
    pub fn wavedump742() -> Self {
        let mut structure = Self::wavedump();
        structure
            .fields
            .push(TextField::new("start_index_cell", "Start Index Cell:"));
        structure
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    fn require(&self, name: &'static str) -> Result<usize, DecodeError> {
        self.position(name)
            .ok_or(DecodeError::MissingStructureField(name))
    }
}

const EVENT_START: &[u8] = b"Record Length:";
const START_INDEX_LABEL: &[u8] = b"Start Index Cell:";

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn line_end(data: &[u8], pos: usize) -> usize {
    data[pos..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(data.len(), |p| pos + p)
}

/// Parse a header token: hexadecimal when `0x` prefixed, decimal otherwise
pub fn parse_token(token: &str) -> Result<i64, DecodeError> {
    let token = token.trim();
    let parsed = match token
        .strip_prefix(WD_HEX_PREFIX)
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => token.parse::<i64>(),
    };
    parsed.map_err(|_| DecodeError::BadTextValue(token.to_string()))
}

/// Probe for WaveDump text output
pub fn sniff(data: &[u8]) -> bool {
    data.starts_with(EVENT_START)
}

/// Probe for x742 WaveDump text output, which carries a start index cell per event
pub fn sniff_742(data: &[u8]) -> bool {
    if !sniff(data) {
        return false;
    }
    let first_end = find(&data[1..], EVENT_START).map_or(data.len(), |p| p + 1);
    find(&data[..first_end], START_INDEX_LABEL).is_some()
}

#[derive(Debug, Clone)]
enum WdField {
    Input(Value),
    Header(usize),
    Timestamp,
    Waveform,
}

/// Decoder for the line oriented WaveDump text formats.
///
/// Events are located once by scanning for the first label of the structure; header
/// values and samples are parsed from the text only when read.
#[derive(Debug)]
pub struct WaveDumpDecoder {
    structure: TextStructure,
    offsets: Vec<usize>,
    n_events: usize,
    event_number_offset: i64,
    record_length_idx: usize,
    event_number_idx: usize,
    timestamp_idx: usize,
    fields: FieldTable<WdField>,
    buffer: SampleBuffer,
}

impl WaveDumpDecoder {
    pub fn new(structure: TextStructure) -> Self {
        Self {
            structure,
            offsets: Vec::new(),
            n_events: 0,
            event_number_offset: 0,
            record_length_idx: 0,
            event_number_idx: 0,
            timestamp_idx: 0,
            fields: FieldTable::new(),
            buffer: SampleBuffer::new(),
        }
    }

    pub fn event_number_offset(&self) -> i64 {
        self.event_number_offset
    }

    fn event_range(&self, idx: usize, data_len: usize) -> Result<(usize, usize), DecodeError> {
        if idx >= self.n_events {
            return Err(DecodeError::BadEventIndex {
                idx,
                n_events: self.n_events,
            });
        }
        let start = self.offsets[idx];
        let end = self.offsets.get(idx + 1).copied().unwrap_or(data_len);
        Ok((start, end))
    }

    /// Byte range of the line carrying `label` within event bytes `start..end`
    fn label_line(
        data: &[u8],
        start: usize,
        end: usize,
        label: &str,
    ) -> Result<(usize, usize), DecodeError> {
        let found = find(&data[start..end], label.as_bytes())
            .ok_or_else(|| DecodeError::MissingLabel(label.to_string()))?;
        let value_start = start + found + label.len();
        Ok((value_start, line_end(data, value_start).min(end)))
    }

    fn header_value(
        data: &[u8],
        start: usize,
        end: usize,
        label: &str,
    ) -> Result<i64, DecodeError> {
        let (from, to) = Self::label_line(data, start, end, label)?;
        parse_token(&String::from_utf8_lossy(&data[from..to]))
    }

    fn field_value(&self, data: &[u8], idx: usize, field: usize) -> Result<i64, DecodeError> {
        let (start, end) = self.event_range(idx, data.len())?;
        Self::header_value(data, start, end, &self.structure.fields[field].label)
    }

    fn read_waveform(&mut self, data: &[u8], idx: usize) -> Result<Value, DecodeError> {
        let (start, end) = self.event_range(idx, data.len())?;
        let record_length = self.field_value(data, idx, self.record_length_idx)?;
        if record_length < 0 {
            return Err(DecodeError::BadHeaderValue(
                RECORD_LENGTH,
                record_length as u64,
            ));
        }
        // Samples begin on the line after the last header label
        let last_label = match self.structure.fields.last() {
            Some(f) => f.label.as_str(),
            None => return Err(DecodeError::MissingStructureField(RECORD_LENGTH)),
        };
        let (_, label_end) = Self::label_line(data, start, end, last_label)?;
        let mut pos = label_end + 1;

        // Every sample takes at least a digit and a line break
        let available = (end.saturating_sub(pos) + 1) / 2;
        if record_length as u64 > available as u64 {
            return Err(DecodeError::BadHeaderValue(
                RECORD_LENGTH,
                record_length as u64,
            ));
        }
        self.buffer.reset(record_length as usize);
        for _ in 0..record_length {
            if pos >= end {
                return Err(DecodeError::Truncated { offset: pos, needed: 1 });
            }
            let line_stop = line_end(data, pos).min(end);
            let line = String::from_utf8_lossy(&data[pos..line_stop]);
            let sample = line
                .trim()
                .parse::<i32>()
                .map_err(|_| DecodeError::BadTextValue(line.trim().to_string()))?;
            self.buffer.push(sample);
            pos = line_stop + 1;
        }
        Ok(Value::Waveform(self.buffer.to_waveform()))
    }

    fn set_n_events(&mut self, data: &[u8]) -> Result<(), DecodeError> {
        // The last event in a WaveDump file is frequently cut short, so it is never served
        self.n_events = self.offsets.len().saturating_sub(1);
        self.event_number_offset = match self.offsets.first() {
            Some(first) => {
                let end = self.offsets.get(1).copied().unwrap_or(data.len());
                let label = &self.structure.fields[self.event_number_idx].label;
                Self::header_value(data, *first, end, label)?
            }
            None => 0,
        };
        Ok(())
    }
}

impl Decoder for WaveDumpDecoder {
    fn format(&self) -> Format {
        if self.structure.position("start_index_cell").is_some() {
            Format::WaveDump742
        } else {
            Format::WaveDump
        }
    }

    fn load(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        self.record_length_idx = self.structure.require(RECORD_LENGTH)?;
        self.event_number_idx = self.structure.require(EVENT_NUMBER)?;
        self.timestamp_idx = self.structure.require(TRIGGER_TIME_STAMP)?;

        let start_label = self.structure.fields[0].label.as_bytes();
        self.offsets.clear();
        let mut pos = 0;
        while pos < data.len() {
            if data[pos..].starts_with(start_label) {
                self.offsets.push(pos);
            }
            pos = line_end(data, pos) + 1;
        }
        self.set_n_events(data)?;

        self.fields.clear();
        self.fields
            .insert_input("n_events", WdField::Input(self.n_events.into()));
        self.fields.insert_input(
            "event_number_offset",
            WdField::Input(self.event_number_offset.into()),
        );
        for (i, field) in self.structure.fields.iter().enumerate() {
            self.fields.insert_event(&field.name, WdField::Header(i));
        }
        self.fields.insert_event("timestamp", WdField::Timestamp);
        self.fields.insert_event("raw_waveform", WdField::Waveform);
        Ok(self.n_events)
    }

    fn n_events(&self) -> usize {
        self.n_events
    }

    fn resolve(&self, path: &str) -> Option<FieldId> {
        self.fields.resolve(path)
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.names().to_vec()
    }

    fn timestamp(&mut self, data: &[u8], idx: usize) -> Result<u64, DecodeError> {
        let ts = self.field_value(data, idx, self.timestamp_idx)?;
        u64::try_from(ts).map_err(|_| DecodeError::BadTextValue(ts.to_string()))
    }

    fn read(
        &mut self,
        data: &[u8],
        idx: usize,
        field: FieldId,
    ) -> Result<Option<Value>, DecodeError> {
        let field = match self.fields.get(field) {
            Some(f) => f.clone(),
            None => return Ok(None),
        };
        match field {
            WdField::Input(value) => Ok(Some(value)),
            WdField::Header(i) => {
                let mut value = self.field_value(data, idx, i)?;
                if i == self.event_number_idx {
                    value -= self.event_number_offset;
                }
                Ok(Some(Value::Int(value)))
            }
            WdField::Timestamp => Ok(Some(self.timestamp(data, idx)?.into())),
            WdField::Waveform => Ok(Some(self.read_waveform(data, idx)?)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// WaveDump text with `n_events` events numbered from `first_number`
    pub(crate) fn wavedump_text(
        n_events: usize,
        first_number: usize,
        record_length: usize,
        with_742: bool,
    ) -> String {
        let mut text = String::new();
        for i in 0..n_events {
            text.push_str(&format!("Record Length: {record_length}\n"));
            text.push_str("BoardID: 2\n");
            text.push_str("Channel: 4\n");
            text.push_str(&format!("Event Number: {}\n", first_number + i));
            text.push_str("Pattern: 0x00A0\n");
            text.push_str(&format!("Trigger Time Stamp: {}\n", 5000 + 100 * i));
            text.push_str("DC offset (DAC): 0x1999\n");
            if with_742 {
                text.push_str(&format!("Start Index Cell: {}\n", 10 * i));
            }
            for s in 0..record_length {
                text.push_str(&format!("{}\n", 3000 + i * 10 + s));
            }
        }
        text
    }

    #[test]
    fn test_trailing_event_dropped_and_numbers_offset() {
        let text = wavedump_text(4, 17, 5, false);
        let data = text.as_bytes();
        assert!(sniff(data));
        assert!(!sniff_742(data));
        let mut decoder = WaveDumpDecoder::new(TextStructure::wavedump());
        assert_eq!(decoder.load(data).unwrap(), 3);
        assert_eq!(decoder.event_number_offset(), 17);

        let number = decoder.resolve("EVENT:event_number").unwrap();
        assert_eq!(decoder.read(data, 0, number).unwrap(), Some(Value::Int(0)));
        assert_eq!(decoder.read(data, 2, number).unwrap(), Some(Value::Int(2)));
        assert!(decoder.read(data, 3, number).is_err());
    }

    #[test]
    fn test_oversized_record_length_rejected() {
        let text = wavedump_text(2, 0, 4, false).replacen(
            "Record Length: 4",
            "Record Length: 999999999999999",
            1,
        );
        let data = text.as_bytes();
        let mut decoder = WaveDumpDecoder::new(TextStructure::wavedump());
        assert_eq!(decoder.load(data).unwrap(), 1);
        let wave = decoder.resolve("EVENT:raw_waveform").unwrap();
        assert!(matches!(
            decoder.read(data, 0, wave),
            Err(DecodeError::BadHeaderValue(RECORD_LENGTH, 999_999_999_999_999))
        ));
    }

    #[test]
    fn test_header_and_samples() {
        let text = wavedump_text(3, 0, 4, false);
        let data = text.as_bytes();
        let mut decoder = WaveDumpDecoder::new(TextStructure::wavedump());
        decoder.load(data).unwrap();

        let pattern = decoder.resolve("EVENT:pattern").unwrap();
        assert_eq!(decoder.read(data, 1, pattern).unwrap(), Some(Value::Int(0xA0)));
        let dc = decoder.resolve("EVENT:dc_offset").unwrap();
        assert_eq!(decoder.read(data, 0, dc).unwrap(), Some(Value::Int(0x1999)));
        assert_eq!(decoder.timestamp(data, 1).unwrap(), 5100);

        let wave = decoder.resolve("EVENT:raw_waveform").unwrap();
        assert_eq!(
            decoder.read(data, 1, wave).unwrap(),
            Some(Value::Waveform(vec![3010, 3011, 3012, 3013]))
        );
    }

    #[test]
    fn test_742_layout() {
        let text = wavedump_text(3, 0, 2, true);
        let data = text.as_bytes();
        assert!(sniff_742(data));
        let mut decoder = WaveDumpDecoder::new(TextStructure::wavedump742());
        decoder.load(data).unwrap();
        assert_eq!(decoder.format(), Format::WaveDump742);
        let cell = decoder.resolve("EVENT:start_index_cell").unwrap();
        assert_eq!(decoder.read(data, 1, cell).unwrap(), Some(Value::Int(10)));
        let wave = decoder.resolve("EVENT:raw_waveform").unwrap();
        assert_eq!(
            decoder.read(data, 0, wave).unwrap(),
            Some(Value::Waveform(vec![3000, 3001]))
        );
    }

    #[test]
    fn test_structure_override() {
        let text = "Len: 2\nEvt: 5\nTime: 0x10\n7\n8\nLen: 2\nEvt: 6\nTime: 0x20\n9\n10\nLen: 2\n";
        let structure = TextStructure {
            fields: vec![
                TextField::new(RECORD_LENGTH, "Len:"),
                TextField::new(EVENT_NUMBER, "Evt:"),
                TextField::new(TRIGGER_TIME_STAMP, "Time:"),
            ],
        };
        let data = text.as_bytes();
        let mut decoder = WaveDumpDecoder::new(structure);
        assert_eq!(decoder.load(data).unwrap(), 2);
        assert_eq!(decoder.timestamp(data, 1).unwrap(), 0x20);
        let wave = decoder.resolve("EVENT:raw_waveform").unwrap();
        assert_eq!(
            decoder.read(data, 1, wave).unwrap(),
            Some(Value::Waveform(vec![9, 10]))
        );
    }

    #[test]
    fn test_missing_required_field() {
        let structure = TextStructure {
            fields: vec![TextField::new(RECORD_LENGTH, "Len:")],
        };
        let mut decoder = WaveDumpDecoder::new(structure);
        assert!(matches!(
            decoder.load(b"Len: 1\n1\n"),
            Err(DecodeError::MissingStructureField(EVENT_NUMBER))
        ));
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token(" 0x1F ").unwrap(), 31);
        assert_eq!(parse_token("-12").unwrap(), -12);
        assert!(parse_token("abc").is_err());
    }
}
