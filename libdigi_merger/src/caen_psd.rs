use bit_set::BitSet;

use super::buffer::SampleBuffer;
use super::caen::{read_word, unpack_samples};
use super::constants::*;
use super::error::DecodeError;
use super::field::{FieldId, FieldTable};
use super::format::{Decoder, Format};
use super::store::Value;

/// Header of a board aggregate, the outer block of DPP-PSD data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardAggregate {
    pub size_words: usize,
    pub board_id: u8,
    pub board_fail: bool,
    pub pattern: u16,
    pub couple_mask: u8,
    pub counter: u32,
    pub board_time: u32,
}

impl BoardAggregate {
    pub fn parse(data: &[u8], pos: usize) -> Result<Self, DecodeError> {
        let word0 = read_word(data, pos)?;
        if word0 & CAEN_SYNC_MASK != CAEN_SYNC_PATTERN {
            return Err(DecodeError::BadHeaderWord {
                word: word0,
                offset: pos,
            });
        }
        let word1 = read_word(data, pos + CAEN_WORD_SIZE)?;
        let word2 = read_word(data, pos + 2 * CAEN_WORD_SIZE)?;
        let word3 = read_word(data, pos + 3 * CAEN_WORD_SIZE)?;
        Ok(Self {
            size_words: (word0 & CAEN_EVENT_SIZE_MASK) as usize,
            board_id: ((word1 & CAEN_BOARD_ID_MASK) >> CAEN_BOARD_ID_SHIFT) as u8,
            board_fail: word1 & CAEN_BOARD_FAIL_MASK != 0,
            pattern: ((word1 & CAEN_PATTERN_MASK) >> CAEN_PATTERN_SHIFT) as u16,
            couple_mask: (word1 & PSD_COUPLE_MASK) as u8,
            counter: word2 & PSD_AGGREGATE_COUNTER_MASK,
            board_time: word3,
        })
    }
}

/// Per channel-pair settings that fix the size of every sub-event in the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelFormat {
    n_samples: usize,
    waveform: bool,
    extras: bool,
}

impl ChannelFormat {
    fn parse(word: u32) -> Self {
        Self {
            n_samples: (word & PSD_NSAMPLES_MASK) as usize * PSD_SAMPLES_PER_UNIT,
            waveform: word & PSD_WAVEFORM_FLAG != 0,
            extras: word & PSD_EXTRAS_FLAG != 0,
        }
    }

    fn waveform_words(&self) -> usize {
        if self.waveform {
            self.n_samples / 2
        } else {
            0
        }
    }

    fn event_words(&self) -> usize {
        1 + self.waveform_words() + self.extras as usize + 1
    }
}

/// One single-channel acquisition frame inside a channel aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubEvent {
    pub pos: usize,
    pub channel: usize,
    pub timestamp: u64,
    pub board_id: u8,
    format: ChannelFormat,
}

impl SubEvent {
    fn charge_pos(&self) -> usize {
        self.pos + (1 + self.format.waveform_words() + self.format.extras as usize) * CAEN_WORD_SIZE
    }

    fn extras_pos(&self) -> Option<usize> {
        self.format
            .extras
            .then(|| self.pos + (1 + self.format.waveform_words()) * CAEN_WORD_SIZE)
    }
}

/// Sub-events gathered inside one coincidence window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsdEvent {
    pub time: u64,
    pub upper: u64,
    pub sub_events: Vec<SubEvent>,
}

impl PsdEvent {
    fn seed(sub: SubEvent, window: u64) -> Self {
        Self {
            time: sub.timestamp,
            upper: sub.timestamp.saturating_add(window),
            sub_events: vec![sub],
        }
    }

    pub fn sub_event(&self, channel: usize) -> Option<&SubEvent> {
        self.sub_events.iter().find(|s| s.channel == channel)
    }
}

/// Group sub-events, in file order, into events.
///
/// A sub-event joins the open event when it falls at or before the window's upper bound
/// and its channel is still free; joining pushes the upper bound out to
/// `timestamp + window` if that is later. Anything else closes the event and seeds the
/// next one. Returns the events and the number of sub-events turned away because their
/// channel was already taken.
pub fn merge_sub_events<I>(sub_events: I, window: u64) -> (Vec<PsdEvent>, usize)
where
    I: IntoIterator<Item = SubEvent>,
{
    let mut events = Vec::new();
    let mut collisions = 0;
    let mut open: Option<(PsdEvent, BitSet)> = None;
    for sub in sub_events {
        if let Some((event, claimed)) = open.as_mut() {
            let in_window = sub.timestamp <= event.upper;
            if in_window && !claimed.contains(sub.channel) {
                claimed.insert(sub.channel);
                event.upper = event.upper.max(sub.timestamp.saturating_add(window));
                event.sub_events.push(sub);
                continue;
            }
            if in_window {
                collisions += 1;
                log::debug!(
                    "PSD sub-event on channel {} at {} collides with the open event at {}",
                    sub.channel,
                    sub.timestamp,
                    event.time
                );
            }
        }
        if let Some((event, _)) = open.take() {
            events.push(event);
        }
        let mut claimed = BitSet::with_capacity(CAEN_N_CHANNELS);
        claimed.insert(sub.channel);
        open = Some((PsdEvent::seed(sub, window), claimed));
    }
    if let Some((event, _)) = open {
        events.push(event);
    }
    (events, collisions)
}

/// Walk one board aggregate, appending its sub-events. Returns false if it is malformed.
fn scan_board_aggregate(
    data: &[u8],
    pos: usize,
    board: &BoardAggregate,
    sub_events: &mut Vec<SubEvent>,
) -> bool {
    let end = pos + board.size_words * CAEN_WORD_SIZE;
    let mut cursor = pos + CAEN_HEADER_WORDS * CAEN_WORD_SIZE;
    let start_len = sub_events.len();
    for couple in 0..8 {
        if board.couple_mask & (1 << couple) == 0 {
            continue;
        }
        let (word0, word1) = match (read_word(data, cursor), read_word(data, cursor + 4)) {
            (Ok(w0), Ok(w1)) => (w0, w1),
            _ => return false,
        };
        let size = (word0 & PSD_CHANNEL_AGG_SIZE_MASK) as usize;
        if word0 & PSD_CHANNEL_AGG_FLAG == 0
            || size < PSD_CHANNEL_AGG_HEADER_WORDS
            || cursor + size * CAEN_WORD_SIZE > end
        {
            sub_events.truncate(start_len);
            return false;
        }
        let format = ChannelFormat::parse(word1);
        let event_words = format.event_words();
        let body = size - PSD_CHANNEL_AGG_HEADER_WORDS;
        if body % event_words != 0 {
            sub_events.truncate(start_len);
            return false;
        }
        let mut event_pos = cursor + PSD_CHANNEL_AGG_HEADER_WORDS * CAEN_WORD_SIZE;
        for _ in 0..body / event_words {
            let time_word = match read_word(data, event_pos) {
                Ok(w) => w,
                Err(_) => {
                    sub_events.truncate(start_len);
                    return false;
                }
            };
            let odd = (time_word & PSD_ODD_CHANNEL_FLAG != 0) as usize;
            let mut timestamp = (time_word & PSD_TRIGGER_TIME_MASK) as u64;
            if format.extras {
                let extras_pos = event_pos + (1 + format.waveform_words()) * CAEN_WORD_SIZE;
                if let Ok(extras) = read_word(data, extras_pos) {
                    let extended = (extras & PSD_EXTENDED_TIME_MASK) >> PSD_EXTENDED_TIME_SHIFT;
                    timestamp |= (extended as u64) << PSD_TRIGGER_TIME_BITS;
                }
            }
            sub_events.push(SubEvent {
                pos: event_pos,
                channel: 2 * couple + odd,
                timestamp,
                board_id: board.board_id,
                format,
            });
            event_pos += event_words * CAEN_WORD_SIZE;
        }
        cursor += size * CAEN_WORD_SIZE;
    }
    true
}

/// Probe for DPP-PSD data: a board aggregate whose first block is a channel aggregate
pub fn sniff(data: &[u8]) -> bool {
    let board = match BoardAggregate::parse(data, 0) {
        Ok(b) => b,
        Err(_) => return false,
    };
    if board.size_words <= CAEN_HEADER_WORDS
        || board.size_words * CAEN_WORD_SIZE > data.len()
        || board.couple_mask == 0
    {
        return false;
    }
    let mut sub_events = Vec::new();
    scan_board_aggregate(data, 0, &board, &mut sub_events)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelField {
    Timestamp,
    FineTime,
    ChargeLong,
    ChargeShort,
    Pileup,
    BoardId,
    Waveform,
}

impl ChannelField {
    const ALL: [(Self, &'static str); 7] = [
        (Self::Timestamp, "timestamp"),
        (Self::FineTime, "fine_time"),
        (Self::ChargeLong, "charge_long"),
        (Self::ChargeShort, "charge_short"),
        (Self::Pileup, "pileup"),
        (Self::BoardId, "board_id"),
        (Self::Waveform, "raw_waveform"),
    ];
}

#[derive(Debug, Clone)]
enum PsdField {
    Input(Value),
    Time,
    NSubEvents,
    Channels,
    Channel(usize, ChannelField),
}

/// Decoder for CAEN 1730 DPP-PSD data.
///
/// Loading indexes every sub-event in the file and merges them into events with
/// `merge_sub_events`; reads only decode the words of the requested sub-event.
#[derive(Debug, Default)]
pub struct PsdDecoder {
    coincidence_window: u64,
    events: Vec<PsdEvent>,
    n_sub_events: usize,
    collisions: usize,
    fields: FieldTable<PsdField>,
    buffer: SampleBuffer,
}

impl PsdDecoder {
    pub fn new(coincidence_window: u64) -> Self {
        Self {
            coincidence_window,
            ..Default::default()
        }
    }

    pub fn events(&self) -> &[PsdEvent] {
        &self.events
    }

    /// Sub-events rejected because their channel was already in the open event
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    fn event(&self, idx: usize) -> Result<&PsdEvent, DecodeError> {
        self.events.get(idx).ok_or(DecodeError::BadEventIndex {
            idx,
            n_events: self.events.len(),
        })
    }

    fn read_channel(
        &mut self,
        data: &[u8],
        idx: usize,
        channel: usize,
        kind: ChannelField,
    ) -> Result<Option<Value>, DecodeError> {
        let sub = match self.event(idx)?.sub_event(channel) {
            Some(s) => *s,
            None => return Ok(None),
        };
        let value: Value = match kind {
            ChannelField::Timestamp => sub.timestamp.into(),
            ChannelField::BoardId => (sub.board_id as u32).into(),
            ChannelField::FineTime => match sub.extras_pos() {
                Some(pos) => (read_word(data, pos)? & PSD_FINE_TIME_MASK).into(),
                None => return Ok(None),
            },
            ChannelField::ChargeLong => {
                ((read_word(data, sub.charge_pos())? & PSD_CHARGE_LONG_MASK)
                    >> PSD_CHARGE_LONG_SHIFT)
                    .into()
            }
            ChannelField::ChargeShort => {
                (read_word(data, sub.charge_pos())? & PSD_CHARGE_SHORT_MASK).into()
            }
            ChannelField::Pileup => {
                ((read_word(data, sub.charge_pos())? & PSD_PILEUP_MASK != 0) as u32).into()
            }
            ChannelField::Waveform => {
                if !sub.format.waveform {
                    return Ok(None);
                }
                self.buffer.reset(sub.format.n_samples);
                for w in 0..sub.format.waveform_words() {
                    let word = read_word(data, sub.pos + (1 + w) * CAEN_WORD_SIZE)?;
                    let (first, second) = unpack_samples(word);
                    self.buffer.push(first);
                    self.buffer.push(second);
                }
                Value::Waveform(self.buffer.to_waveform())
            }
        };
        Ok(Some(value))
    }
}

impl Decoder for PsdDecoder {
    fn format(&self) -> Format {
        Format::CaenPsd
    }

    fn load(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        let mut sub_events = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let board = match BoardAggregate::parse(data, pos) {
                Ok(b) => b,
                Err(e) => {
                    log::debug!("PSD aggregate scan stopped at byte {pos}: {e}");
                    break;
                }
            };
            if board.size_words < CAEN_HEADER_WORDS
                || pos + board.size_words * CAEN_WORD_SIZE > data.len()
                || !scan_board_aggregate(data, pos, &board, &mut sub_events)
            {
                log::debug!("PSD board aggregate at byte {pos} is malformed; scan stopped");
                break;
            }
            pos += board.size_words * CAEN_WORD_SIZE;
        }

        self.n_sub_events = sub_events.len();
        let (events, collisions) = merge_sub_events(sub_events, self.coincidence_window);
        self.events = events;
        self.collisions = collisions;
        if collisions > 0 {
            log::debug!(
                "PSD merge turned away {collisions} of {} sub-events on occupied channels",
                self.n_sub_events
            );
        }

        self.fields.clear();
        self.fields.insert_input(
            "coincidence_window",
            PsdField::Input(self.coincidence_window.into()),
        );
        self.fields
            .insert_input("n_sub_events", PsdField::Input(self.n_sub_events.into()));
        self.fields
            .insert_input("channel_collisions", PsdField::Input(collisions.into()));
        self.fields
            .insert_input("n_events", PsdField::Input(self.events.len().into()));
        self.fields.insert_event("timestamp", PsdField::Time);
        self.fields.insert_event("n_sub_events", PsdField::NSubEvents);
        self.fields.insert_event("channels", PsdField::Channels);
        for ch in 0..CAEN_N_CHANNELS {
            for (kind, name) in ChannelField::ALL {
                self.fields
                    .insert_event(&format!("ch_{ch}:{name}"), PsdField::Channel(ch, kind));
            }
        }
        Ok(self.events.len())
    }

    fn n_events(&self) -> usize {
        self.events.len()
    }

    fn resolve(&self, path: &str) -> Option<FieldId> {
        self.fields.resolve(path)
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.names().to_vec()
    }

    fn timestamp(&mut self, _data: &[u8], idx: usize) -> Result<u64, DecodeError> {
        Ok(self.event(idx)?.time)
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
            PsdField::Input(value) => Ok(Some(value)),
            PsdField::Time => Ok(Some(self.event(idx)?.time.into())),
            PsdField::NSubEvents => Ok(Some(self.event(idx)?.sub_events.len().into())),
            PsdField::Channels => Ok(Some(Value::Ints(
                self.event(idx)?
                    .sub_events
                    .iter()
                    .map(|s| s.channel as i64)
                    .collect(),
            ))),
            PsdField::Channel(ch, kind) => self.read_channel(data, idx, ch, kind),
        }
    }
}
