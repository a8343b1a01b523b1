//! The 4-word event header shared by the CAEN 1730 firmwares, and the forward scan
//! that indexes events by their header.
use bitvec::prelude::*;
use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use super::error::DecodeError;
use super::store::Value;

/// Read the little-endian word at byte `pos`
pub fn read_word(data: &[u8], pos: usize) -> Result<u32, DecodeError> {
    if pos + CAEN_WORD_SIZE > data.len() {
        return Err(DecodeError::Truncated {
            offset: pos,
            needed: pos + CAEN_WORD_SIZE - data.len(),
        });
    }
    Ok(LittleEndian::read_u32(&data[pos..pos + CAEN_WORD_SIZE]))
}

/// Split a payload word into its two 14-bit samples, lower half first
pub fn unpack_samples(word: u32) -> (i32, i32) {
    (
        (word & CAEN_SAMPLE_MASK) as i32,
        ((word >> CAEN_UPPER_SAMPLE_SHIFT) & CAEN_SAMPLE_MASK) as i32,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    pub size_words: usize,
    pub board_id: u8,
    pub board_fail: bool,
    pub compressed: bool,
    pub pattern: u16,
    pub channel_mask: u16,
    pub event_counter: u32,
    pub trigger_time_tag: u32,
}

impl EventHeader {
    /// Parse the header starting at byte `pos`
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

        let mask_low = (word1 & CAEN_CHANNEL_MASK_LOW) as u16;
        let mask_high = ((word2 & CAEN_CHANNEL_MASK_HIGH) >> CAEN_CHANNEL_MASK_HIGH_SHIFT) as u16;
        Ok(Self {
            size_words: (word0 & CAEN_EVENT_SIZE_MASK) as usize,
            board_id: ((word1 & CAEN_BOARD_ID_MASK) >> CAEN_BOARD_ID_SHIFT) as u8,
            board_fail: word1 & CAEN_BOARD_FAIL_MASK != 0,
            compressed: word1 & CAEN_ZLE_FLAG_MASK != 0,
            pattern: ((word1 & CAEN_PATTERN_MASK) >> CAEN_PATTERN_SHIFT) as u16,
            channel_mask: mask_low | (mask_high << 8),
            event_counter: word2 & CAEN_EVENT_COUNTER_MASK,
            trigger_time_tag: word3,
        })
    }

    /// Active channels in ascending order
    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.channel_mask.view_bits::<Lsb0>().iter_ones()
    }

    pub fn n_channels(&self) -> usize {
        self.channel_mask.count_ones() as usize
    }

    pub fn has_channel(&self, channel: usize) -> bool {
        channel < CAEN_N_CHANNELS && self.channel_mask & (1 << channel) != 0
    }

    /// Position of `channel` among the active channels
    pub fn channel_rank(&self, channel: usize) -> Option<usize> {
        self.channels().position(|c| c == channel)
    }

    pub fn size_bytes(&self) -> usize {
        self.size_words * CAEN_WORD_SIZE
    }

    pub fn payload_words(&self) -> usize {
        self.size_words.saturating_sub(CAEN_HEADER_WORDS)
    }

    /// Trigger time tag without the rollover bit
    pub fn timestamp(&self) -> u64 {
        (self.trigger_time_tag & CAEN_TRIGGER_TIME_MASK) as u64
    }
}

/// Header-level fields shared by the RAW and ZLE decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Timestamp,
    BoardId,
    BoardFail,
    Pattern,
    ChannelMask,
    EventCounter,
    TriggerTimeTag,
    Channels,
}

impl HeaderField {
    pub const ALL: [(Self, &'static str); 8] = [
        (Self::Timestamp, "timestamp"),
        (Self::BoardId, "board_id"),
        (Self::BoardFail, "board_fail"),
        (Self::Pattern, "pattern"),
        (Self::ChannelMask, "channel_mask"),
        (Self::EventCounter, "event_counter"),
        (Self::TriggerTimeTag, "trigger_time_tag"),
        (Self::Channels, "channels"),
    ];

    pub fn value(&self, header: &EventHeader) -> Value {
        match self {
            Self::Timestamp => header.timestamp().into(),
            Self::BoardId => (header.board_id as u32).into(),
            Self::BoardFail => (header.board_fail as u32).into(),
            Self::Pattern => (header.pattern as u32).into(),
            Self::ChannelMask => (header.channel_mask as u32).into(),
            Self::EventCounter => header.event_counter.into(),
            Self::TriggerTimeTag => header.trigger_time_tag.into(),
            Self::Channels => Value::Ints(header.channels().map(|c| c as i64).collect()),
        }
    }
}

/// Index every event in `data` by walking the headers forward from byte 0.
///
/// `valid` is asked to accept each header and its payload. The scan stops at the first
/// malformed or truncated event; that event and anything after it are dropped.
pub fn scan_events<F>(data: &[u8], mut valid: F) -> Vec<usize>
where
    F: FnMut(&EventHeader, &[u8], usize) -> bool,
{
    let mut offsets = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header = match EventHeader::parse(data, pos) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("CAEN event scan stopped at byte {pos}: {e}");
                break;
            }
        };
        if header.size_words < CAEN_HEADER_WORDS || pos + header.size_bytes() > data.len() {
            log::debug!(
                "CAEN event at byte {pos} declares {} words which do not fit; scan stopped",
                header.size_words
            );
            break;
        }
        if !valid(&header, data, pos) {
            log::debug!("CAEN event at byte {pos} has an inconsistent payload; scan stopped");
            break;
        }
        offsets.push(pos);
        pos += header.size_bytes();
    }
    offsets
}

/// Probe helper: does the first event of `data` parse, fit, and pass `valid`
pub fn first_event_matches<F>(data: &[u8], valid: F) -> bool
where
    F: FnOnce(&EventHeader, &[u8], usize) -> bool,
{
    match EventHeader::parse(data, 0) {
        Ok(header) => {
            header.size_words >= CAEN_HEADER_WORDS
                && header.size_bytes() <= data.len()
                && valid(&header, data, 0)
        }
        Err(_) => false,
    }
}

/// Cache of the most recently decoded event header, keyed by event index
#[derive(Debug, Default)]
pub struct HeaderCache {
    current: Option<(usize, EventHeader)>,
}

impl HeaderCache {
    pub fn get(
        &mut self,
        data: &[u8],
        offsets: &[usize],
        idx: usize,
    ) -> Result<EventHeader, DecodeError> {
        if let Some((cached, header)) = self.current {
            if cached == idx {
                return Ok(header);
            }
        }
        let pos = *offsets.get(idx).ok_or(DecodeError::BadEventIndex {
            idx,
            n_events: offsets.len(),
        })?;
        let header = EventHeader::parse(data, pos)?;
        self.current = Some((idx, header));
        Ok(header)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
