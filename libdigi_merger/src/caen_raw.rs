use super::buffer::SampleBuffer;
use super::caen::{
    first_event_matches, read_word, scan_events, unpack_samples, EventHeader, HeaderCache,
    HeaderField,
};
use super::constants::*;
use super::error::DecodeError;
use super::field::{FieldId, FieldTable};
use super::format::{Decoder, Format};
use super::store::Value;

/// An uncompressed event splits its payload evenly among the active channels
fn payload_is_consistent(header: &EventHeader, data: &[u8], pos: usize) -> bool {
    if header.compressed {
        return false;
    }
    let n_channels = header.n_channels();
    let payload = header.payload_words();
    let even = if n_channels == 0 {
        payload == 0
    } else {
        payload % n_channels == 0
    };
    // Uncompressed samples are 14 bit, so the top two bits of the first payload word are clear
    even && (payload == 0
        || read_word(data, pos + CAEN_HEADER_WORDS * CAEN_WORD_SIZE)
            .map(|w| w & 0xC000_C000 == 0)
            .unwrap_or(false))
}

/// Probe for uncompressed CAEN 1730 data
pub fn sniff(data: &[u8]) -> bool {
    first_event_matches(data, payload_is_consistent)
}

#[derive(Debug, Clone)]
enum RawField {
    Input(Value),
    Header(HeaderField),
    Waveform(usize),
}

/// Decoder for uncompressed CAEN 1730 standard firmware events
#[derive(Debug, Default)]
pub struct RawDecoder {
    offsets: Vec<usize>,
    cache: HeaderCache,
    fields: FieldTable<RawField>,
    buffer: SampleBuffer,
}

impl RawDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_waveform(
        &mut self,
        data: &[u8],
        idx: usize,
        channel: usize,
    ) -> Result<Option<Value>, DecodeError> {
        let header = self.cache.get(data, &self.offsets, idx)?;
        let rank = match header.channel_rank(channel) {
            Some(r) => r,
            None => return Ok(None),
        };
        let n_channels = header.n_channels();
        let payload = header.payload_words();
        if payload % n_channels != 0 {
            return Err(DecodeError::UnevenPayload {
                words: payload,
                channels: n_channels,
            });
        }
        let words_per_channel = payload / n_channels;
        let start = self.offsets[idx]
            + (CAEN_HEADER_WORDS + rank * words_per_channel) * CAEN_WORD_SIZE;

        self.buffer.reset(2 * words_per_channel);
        for w in 0..words_per_channel {
            let (first, second) = unpack_samples(read_word(data, start + w * CAEN_WORD_SIZE)?);
            self.buffer.push(first);
            self.buffer.push(second);
        }
        Ok(Some(Value::Waveform(self.buffer.to_waveform())))
    }
}

impl Decoder for RawDecoder {
    fn format(&self) -> Format {
        Format::CaenRaw
    }

    fn load(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        self.offsets = scan_events(data, payload_is_consistent);
        self.cache.clear();
        self.fields.clear();
        self.fields
            .insert_input("n_events", RawField::Input(self.offsets.len().into()));
        for (field, name) in HeaderField::ALL {
            self.fields.insert_event(name, RawField::Header(field));
        }
        for ch in 0..CAEN_N_CHANNELS {
            self.fields
                .insert_event(&format!("ch_{ch}:raw_waveform"), RawField::Waveform(ch));
        }
        Ok(self.offsets.len())
    }

    fn n_events(&self) -> usize {
        self.offsets.len()
    }

    fn resolve(&self, path: &str) -> Option<FieldId> {
        self.fields.resolve(path)
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.names().to_vec()
    }

    fn timestamp(&mut self, data: &[u8], idx: usize) -> Result<u64, DecodeError> {
        Ok(self.cache.get(data, &self.offsets, idx)?.timestamp())
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
            RawField::Input(value) => Ok(Some(value)),
            RawField::Header(h) => Ok(Some(h.value(&self.cache.get(data, &self.offsets, idx)?))),
            RawField::Waveform(ch) => self.decode_waveform(data, idx, ch),
        }
    }
}
