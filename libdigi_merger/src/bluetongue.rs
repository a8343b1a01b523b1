use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::constants::*;
use super::error::DecodeError;
use super::field::{FieldId, FieldTable};
use super::format::{Decoder, Format};
use super::store::Value;

/// Acquisition topology of one board, as written in the BlueTongue file header
#[derive(Debug, Clone, PartialEq)]
pub struct BoardInfo {
    pub name: String,
    pub kind: String,
    pub record_length: u32,
    pub channels: Vec<u32>,
}

impl BoardInfo {
    fn has_trigger_counts(&self) -> bool {
        self.kind == BT_CAEN1743_TYPE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    U16,
    I16,
    U32,
}

impl Primitive {
    pub fn size(&self) -> usize {
        match self {
            Self::U16 | Self::I16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Location of one field inside an event record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub count: usize,
    pub primitive: Primitive,
    pub offset: usize,
    pub sequence: bool,
}

impl Slot {
    fn scalar(primitive: Primitive, offset: usize) -> Self {
        Self {
            count: 1,
            primitive,
            offset,
            sequence: false,
        }
    }

    fn sequence(primitive: Primitive, count: usize, offset: usize) -> Self {
        Self {
            count,
            primitive,
            offset,
            sequence: true,
        }
    }

    fn size(&self) -> usize {
        self.count * self.primitive.size()
    }
}

/// The parsed file header. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct BlueTongueHeader {
    pub boards: Vec<BoardInfo>,
    pub header_size: usize,
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, DecodeError> {
    let offset = cursor.position() as usize;
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| DecodeError::Truncated { offset, needed: 4 })
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String, DecodeError> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    if start + len > data.len() {
        return Err(DecodeError::Truncated {
            offset: start,
            needed: start + len - data.len(),
        });
    }
    cursor.set_position((start + len) as u64);
    Ok(String::from_utf8_lossy(&data[start..start + len]).into_owned())
}

fn check_bound(name: &'static str, value: u32, max: u32) -> Result<(), DecodeError> {
    if value > max {
        Err(DecodeError::BadHeaderValue(name, value as u64))
    } else {
        Ok(())
    }
}

impl BlueTongueHeader {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(data);
        let n_boards = read_u32(&mut cursor)?;
        if n_boards == 0 {
            return Err(DecodeError::BadHeaderValue("n_boards", 0));
        }
        check_bound("n_boards", n_boards, BT_MAX_BOARDS)?;

        let mut boards = Vec::with_capacity(n_boards as usize);
        for _ in 0..n_boards {
            let name_len = read_u32(&mut cursor)?;
            check_bound("name_len", name_len, BT_MAX_NAME_LEN)?;
            let type_len = read_u32(&mut cursor)?;
            check_bound("type_len", type_len, BT_MAX_NAME_LEN)?;
            let name = read_string(&mut cursor, name_len as usize)?;
            let kind = read_string(&mut cursor, type_len as usize)?;
            let record_length = read_u32(&mut cursor)?;
            check_bound("record_length", record_length, BT_MAX_RECORD_LENGTH)?;
            let n_channels = read_u32(&mut cursor)?;
            check_bound("n_channels", n_channels, BT_MAX_CHANNELS)?;
            let mut channels = Vec::with_capacity(n_channels as usize);
            for _ in 0..n_channels {
                channels.push(read_u32(&mut cursor)?);
            }
            boards.push(BoardInfo {
                name,
                kind,
                record_length,
                channels,
            });
        }

        Ok(Self {
            boards,
            header_size: cursor.position() as usize,
        })
    }

    /// Walk the event layout, accumulating byte offsets.
    ///
    /// Returns the named slots and the total size of one event record.
    pub fn event_layout(&self) -> (Vec<(String, Slot)>, usize) {
        let mut slots = Vec::new();
        let mut offset = 0;
        let mut push = |name: String, slot: Slot, offset: &mut usize| {
            *offset += slot.size();
            slots.push((name, slot));
        };

        push(
            String::from("timestamp"),
            Slot::scalar(Primitive::U32, offset),
            &mut offset,
        );
        for (b, board) in self.boards.iter().enumerate() {
            push(
                format!("board_{b}:event_counter"),
                Slot::scalar(Primitive::U32, offset),
                &mut offset,
            );
            push(
                format!("board_{b}:trigger_time_tag"),
                Slot::scalar(Primitive::U32, offset),
                &mut offset,
            );
            for ch in board.channels.iter() {
                push(
                    format!("board_{b}:raw_waveform_ch_{ch}"),
                    Slot::sequence(Primitive::I16, board.record_length as usize, offset),
                    &mut offset,
                );
            }
            if board.has_trigger_counts() {
                for ch in board.channels.iter() {
                    push(
                        format!("board_{b}:trigger_count_ch_{ch}"),
                        Slot::scalar(Primitive::U16, offset),
                        &mut offset,
                    );
                    push(
                        format!("board_{b}:time_count_ch_{ch}"),
                        Slot::scalar(Primitive::U16, offset),
                        &mut offset,
                    );
                }
            }
        }
        push(
            String::from("check_word"),
            Slot::scalar(Primitive::U16, offset),
            &mut offset,
        );
        (slots, offset)
    }
}

/// Probe: the header parses and the first record ends with the check word
pub fn sniff(data: &[u8]) -> bool {
    let header = match BlueTongueHeader::parse(data) {
        Ok(h) => h,
        Err(_) => return false,
    };
    let (_, event_size) = header.event_layout();
    let end = header.header_size + event_size;
    if data.len() < end {
        return false;
    }
    LittleEndian::read_u16(&data[end - 2..end]) == BT_CHECK_WORD
}

#[derive(Debug, Clone)]
enum BtField {
    Input(Value),
    Event(Slot),
}

/// Decoder for the fixed-width BlueTongue layout.
///
/// Every record has the same size, so an event is located by arithmetic alone:
/// `header_size + idx * event_size + field_offset`.
#[derive(Debug, Default)]
pub struct BlueTongueDecoder {
    header: Option<BlueTongueHeader>,
    event_size: usize,
    timestamp_slot: Option<Slot>,
    fields: FieldTable<BtField>,
    n_events: usize,
}

impl BlueTongueDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> Option<&BlueTongueHeader> {
        self.header.as_ref()
    }

    pub fn event_size(&self) -> usize {
        self.event_size
    }

    fn set_n_events(&mut self, data_len: usize, header_size: usize) {
        if data_len < header_size || self.event_size == 0 {
            self.n_events = 0;
            return;
        }
        let body = data_len - header_size;
        self.n_events = body / self.event_size;
        let remainder = body % self.event_size;
        if remainder != 0 {
            log::debug!(
                "BlueTongue file has a trailing partial record of {remainder} bytes; it is ignored"
            );
        }
    }

    fn event_position(&self, idx: usize) -> Result<usize, DecodeError> {
        let header = self.header.as_ref().ok_or(DecodeError::NotLoaded)?;
        if idx >= self.n_events {
            return Err(DecodeError::BadEventIndex {
                idx,
                n_events: self.n_events,
            });
        }
        Ok(header.header_size + idx * self.event_size)
    }

    fn decode_slot(data: &[u8], position: usize, slot: &Slot) -> Result<Value, DecodeError> {
        let start = position + slot.offset;
        let end = start + slot.size();
        if end > data.len() {
            return Err(DecodeError::Truncated {
                offset: start,
                needed: end - data.len(),
            });
        }
        let bytes = &data[start..end];
        let size = slot.primitive.size();
        let at = |i: usize| -> i64 {
            let b = &bytes[i * size..(i + 1) * size];
            match slot.primitive {
                Primitive::U16 => LittleEndian::read_u16(b) as i64,
                Primitive::I16 => LittleEndian::read_i16(b) as i64,
                Primitive::U32 => LittleEndian::read_u32(b) as i64,
            }
        };
        if slot.sequence {
            Ok(Value::Waveform((0..slot.count).map(|i| at(i) as i32).collect()))
        } else {
            Ok(Value::Int(at(0)))
        }
    }
}

impl Decoder for BlueTongueDecoder {
    fn format(&self) -> Format {
        Format::BlueTongue
    }

    fn load(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        let header = BlueTongueHeader::parse(data)?;
        let (slots, event_size) = header.event_layout();
        self.event_size = event_size;
        self.set_n_events(data.len(), header.header_size);

        self.fields.clear();
        self.fields
            .insert_input("n_boards", BtField::Input(header.boards.len().into()));
        self.fields
            .insert_input("header_size", BtField::Input(header.header_size.into()));
        self.fields
            .insert_input("event_size", BtField::Input(event_size.into()));
        self.fields
            .insert_input("n_events", BtField::Input(self.n_events.into()));
        for (b, board) in header.boards.iter().enumerate() {
            self.fields.insert_input(
                &format!("board_{b}:name"),
                BtField::Input(board.name.as_str().into()),
            );
            self.fields.insert_input(
                &format!("board_{b}:type"),
                BtField::Input(board.kind.as_str().into()),
            );
            self.fields.insert_input(
                &format!("board_{b}:record_length"),
                BtField::Input(board.record_length.into()),
            );
            self.fields.insert_input(
                &format!("board_{b}:n_channels"),
                BtField::Input(board.channels.len().into()),
            );
            self.fields.insert_input(
                &format!("board_{b}:channels"),
                BtField::Input(Value::Ints(
                    board.channels.iter().map(|c| *c as i64).collect(),
                )),
            );
        }
        for (name, slot) in slots {
            if name == "timestamp" {
                self.timestamp_slot = Some(slot);
            }
            self.fields.insert_event(&name, BtField::Event(slot));
        }

        if self.n_events > 0 {
            let end = header.header_size + event_size;
            let check = LittleEndian::read_u16(&data[end - 2..end]);
            if check != BT_CHECK_WORD {
                log::warn!("BlueTongue check word is {check}, expected {BT_CHECK_WORD}");
            }
        }
        log::debug!(
            "Loaded BlueTongue header with {} boards, event size {} bytes, {} events",
            header.boards.len(),
            event_size,
            self.n_events
        );
        self.header = Some(header);
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
        let slot = self.timestamp_slot.ok_or(DecodeError::NotLoaded)?;
        let position = self.event_position(idx)?;
        match Self::decode_slot(data, position, &slot)? {
            Value::Int(ts) => Ok(ts as u64),
            _ => Err(DecodeError::NotLoaded),
        }
    }

    fn read(
        &mut self,
        data: &[u8],
        idx: usize,
        field: FieldId,
    ) -> Result<Option<Value>, DecodeError> {
        match self.fields.get(field) {
            Some(BtField::Input(value)) => Ok(Some(value.clone())),
            Some(BtField::Event(slot)) => {
                let slot = *slot;
                let position = self.event_position(idx)?;
                Ok(Some(Self::decode_slot(data, position, &slot)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    pub(crate) struct BoardLayout {
        name: String,
        kind: String,
        record_length: u32,
        channels: Vec<u32>,
    }

    impl BoardLayout {
        pub(crate) fn new(name: &str, kind: &str, record_length: u32, channels: &[u32]) -> Self {
            Self {
                name: name.to_string(),
                kind: kind.to_string(),
                record_length,
                channels: channels.to_vec(),
            }
        }
    }

    pub(crate) fn sample_value(event: usize, channel: u32, sample: usize) -> i16 {
        (event as i16) * 100 + (channel as i16) * 10 + sample as i16 - 50
    }

    pub(crate) fn bluetongue_file_with_times(boards: &[BoardLayout], times: &[u32]) -> Vec<u8> {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(boards.len() as u32).unwrap();
        for board in boards {
            data.write_u32::<LittleEndian>(board.name.len() as u32)
                .unwrap();
            data.write_u32::<LittleEndian>(board.kind.len() as u32)
                .unwrap();
            data.extend_from_slice(board.name.as_bytes());
            data.extend_from_slice(board.kind.as_bytes());
            data.write_u32::<LittleEndian>(board.record_length).unwrap();
            data.write_u32::<LittleEndian>(board.channels.len() as u32)
                .unwrap();
            for ch in board.channels.iter() {
                data.write_u32::<LittleEndian>(*ch).unwrap();
            }
        }
        for (event, time) in times.iter().enumerate() {
            data.write_u32::<LittleEndian>(*time).unwrap();
            for board in boards {
                data.write_u32::<LittleEndian>(event as u32).unwrap();
                data.write_u32::<LittleEndian>(event as u32 * 10).unwrap();
                for ch in board.channels.iter() {
                    for s in 0..board.record_length as usize {
                        data.write_i16::<LittleEndian>(sample_value(event, *ch, s))
                            .unwrap();
                    }
                }
                if board.kind == BT_CAEN1743_TYPE {
                    for ch in board.channels.iter() {
                        data.write_u16::<LittleEndian>(*ch as u16 + 1).unwrap();
                        data.write_u16::<LittleEndian>(*ch as u16 + 2).unwrap();
                    }
                }
            }
            data.write_u16::<LittleEndian>(BT_CHECK_WORD).unwrap();
        }
        data
    }

    /// Build a BlueTongue file with event `i` at timestamp `1000 * i`
    pub(crate) fn bluetongue_file(boards: &[BoardLayout], n_events: usize) -> Vec<u8> {
        let times: Vec<u32> = (0..n_events as u32).map(|i| i * 1000).collect();
        bluetongue_file_with_times(boards, &times)
    }

    fn two_boards() -> Vec<BoardLayout> {
        vec![
            BoardLayout::new("digi_a", "CAEN1730", 8, &[0, 3]),
            BoardLayout::new("digi_b", BT_CAEN1743_TYPE, 4, &[1, 2, 5]),
        ]
    }

    #[test]
    fn test_check_word_every_event() {
        let data = bluetongue_file(&two_boards(), 5);
        let mut decoder = BlueTongueDecoder::new();
        assert_eq!(decoder.load(&data).unwrap(), 5);
        let check = decoder.resolve("EVENT:check_word").unwrap();
        for idx in 0..5 {
            let value = decoder.read(&data, idx, check).unwrap();
            assert_eq!(value, Some(Value::Int(BT_CHECK_WORD as i64)));
        }
    }

    #[test]
    fn test_offsets_and_fields() {
        let data = bluetongue_file(&two_boards(), 3);
        let mut decoder = BlueTongueDecoder::new();
        decoder.load(&data).unwrap();
        // 4 + (8 + 2*8*2) + (8 + 3*4*2 + 3*4) + 2
        assert_eq!(decoder.event_size(), 4 + 40 + 44 + 2);

        let wave = decoder.resolve("EVENT:board_1:raw_waveform_ch_5").unwrap();
        let expected: Vec<i32> = (0..4).map(|s| sample_value(2, 5, s) as i32).collect();
        assert_eq!(
            decoder.read(&data, 2, wave).unwrap(),
            Some(Value::Waveform(expected))
        );

        let count = decoder.resolve("EVENT:board_1:time_count_ch_2").unwrap();
        assert_eq!(decoder.read(&data, 1, count).unwrap(), Some(Value::Int(4)));
        assert!(decoder.resolve("EVENT:board_0:time_count_ch_0").is_none());

        let ttt = decoder.resolve("EVENT:board_0:trigger_time_tag").unwrap();
        assert_eq!(decoder.read(&data, 2, ttt).unwrap(), Some(Value::Int(20)));
        assert_eq!(decoder.timestamp(&data, 2).unwrap(), 2000);

        let rl = decoder.resolve("INPUT:board_1:record_length").unwrap();
        assert_eq!(decoder.read(&data, 0, rl).unwrap(), Some(Value::Int(4)));
        let name = decoder.resolve("INPUT:board_0:name").unwrap();
        assert_eq!(
            decoder.read(&data, 0, name).unwrap(),
            Some(Value::Text(String::from("digi_a")))
        );
    }

    #[test]
    fn test_trailing_partial_record_is_dropped() {
        let mut data = bluetongue_file(&two_boards(), 3);
        data.extend_from_slice(&[1, 2, 3, 4, 5]);
        let mut decoder = BlueTongueDecoder::new();
        assert_eq!(decoder.load(&data).unwrap(), 3);
        assert!(matches!(
            decoder.timestamp(&data, 3),
            Err(DecodeError::BadEventIndex { .. })
        ));
    }

    #[test]
    fn test_corrupted_header_fails_sniff() {
        let data = bluetongue_file(&two_boards(), 2);
        assert!(sniff(&data));
        let header = BlueTongueHeader::parse(&data).unwrap();
        // Every byte of the header can be damaged without the probe panicking
        for pos in 0..header.header_size {
            let mut corrupt = data.clone();
            corrupt[pos] = 0xFF;
            let _ = sniff(&corrupt);
        }
        // Damaging any structural size field must fail the probe
        // n_boards, name_len, type_len, record_length and n_channels of board 0
        let name_len = 6;
        let type_len = 8;
        let structural = [0, 4, 8, 12 + name_len + type_len, 16 + name_len + type_len];
        for pos in structural {
            let mut corrupt = data.clone();
            corrupt[pos + 3] = 0x7F;
            assert!(!sniff(&corrupt), "corruption at byte {pos} passed the probe");
        }
        // Truncation anywhere before the first check word fails too
        for len in 0..header.header_size + 10 {
            assert!(!sniff(&data[..len]));
        }
    }
}
