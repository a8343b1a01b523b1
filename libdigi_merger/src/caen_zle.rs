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

/// The control word opening each channel block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    baseline: i32,
    length: usize,
}

impl Control {
    fn parse(word: u32) -> Self {
        Self {
            baseline: ((word & ZLE_BASELINE_MASK) >> ZLE_BASELINE_SHIFT) as i32,
            length: (word & ZLE_LENGTH_MASK) as usize,
        }
    }
}

fn is_skip(word: u32) -> bool {
    word & ZLE_SKIP_FLAG_MASK == ZLE_SKIP_FLAG
}

/// Channel blocks must tile the payload exactly
fn blocks_are_consistent(header: &EventHeader, data: &[u8], pos: usize) -> bool {
    if !header.compressed {
        return false;
    }
    let mut word = CAEN_HEADER_WORDS;
    for _ in 0..header.n_channels() {
        if word >= header.size_words {
            return false;
        }
        let control = match read_word(data, pos + word * CAEN_WORD_SIZE) {
            Ok(w) => w,
            Err(_) => return false,
        };
        if control & !(ZLE_BASELINE_MASK | ZLE_LENGTH_MASK) != 0 {
            return false;
        }
        word += 1 + Control::parse(control).length;
    }
    word == header.size_words
}

/// Probe for zero-length-encoded CAEN 1730 data
pub fn sniff(data: &[u8]) -> bool {
    first_event_matches(data, blocks_are_consistent)
}

/// Encode one channel's samples as a control word followed by compressed words.
///
/// Each pair of samples that both sit on the baseline becomes part of a skip run; other
/// pairs are stored as-is. Samples are 14 bit, so larger values do not survive the trip.
pub fn compress(samples: &[u16], baseline: u16) -> Result<Vec<u32>, DecodeError> {
    if samples.len() % 2 != 0 {
        return Err(DecodeError::OddSampleCount(samples.len()));
    }
    let mut words = vec![0u32];
    let mut skip: u32 = 0;
    for pair in samples.chunks(2) {
        if pair[0] == baseline && pair[1] == baseline {
            skip += 1;
            if skip == ZLE_SKIP_COUNT_MASK {
                words.push(ZLE_SKIP_FLAG | skip);
                skip = 0;
            }
            continue;
        }
        if skip > 0 {
            words.push(ZLE_SKIP_FLAG | skip);
            skip = 0;
        }
        words.push(
            (pair[0] as u32 & CAEN_SAMPLE_MASK)
                | ((pair[1] as u32 & CAEN_SAMPLE_MASK) << CAEN_UPPER_SAMPLE_SHIFT),
        );
    }
    if skip > 0 {
        words.push(ZLE_SKIP_FLAG | skip);
    }
    let length = words.len() - 1;
    if length > ZLE_LENGTH_MASK as usize {
        return Err(DecodeError::BadHeaderValue("zle_length", length as u64));
    }
    words[0] = (((baseline as u32) & CAEN_SAMPLE_MASK) << ZLE_BASELINE_SHIFT) | length as u32;
    Ok(words)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelField {
    Waveform,
    Baseline,
    NSamples,
}

#[derive(Debug, Clone)]
enum ZleField {
    Input(Value),
    Header(HeaderField),
    Channel(usize, ChannelField),
}

/// Decoder for zero-length-encoded CAEN 1730 standard firmware events
#[derive(Debug, Default)]
pub struct ZleDecoder {
    offsets: Vec<usize>,
    cache: HeaderCache,
    fields: FieldTable<ZleField>,
    buffer: SampleBuffer,
    // (event, channel) currently held in the buffer
    decoded: Option<(usize, usize)>,
}

impl ZleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Byte position of the control word of `channel`, if the channel is in the event
    fn channel_block(
        data: &[u8],
        pos: usize,
        header: &EventHeader,
        channel: usize,
    ) -> Result<Option<usize>, DecodeError> {
        let rank = match header.channel_rank(channel) {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut word_pos = pos + CAEN_HEADER_WORDS * CAEN_WORD_SIZE;
        for _ in 0..rank {
            let control = Control::parse(read_word(data, word_pos)?);
            word_pos += (1 + control.length) * CAEN_WORD_SIZE;
        }
        Ok(Some(word_pos))
    }

    /// Expand the channel into the scratch buffer. Returns the baseline.
    fn expand(
        &mut self,
        data: &[u8],
        idx: usize,
        channel: usize,
    ) -> Result<Option<i32>, DecodeError> {
        let header = self.cache.get(data, &self.offsets, idx)?;
        let block = match Self::channel_block(data, self.offsets[idx], &header, channel)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let control = Control::parse(read_word(data, block)?);
        if self.decoded == Some((idx, channel)) {
            return Ok(Some(control.baseline));
        }

        self.decoded = None;
        self.buffer.reset(2 * control.length);
        for w in 0..control.length {
            let word = read_word(data, block + (1 + w) * CAEN_WORD_SIZE)?;
            if is_skip(word) {
                let run = ZLE_SAMPLES_PER_SKIP * (word & ZLE_SKIP_COUNT_MASK) as usize;
                if self.buffer.len() + run > ZLE_MAX_SAMPLES {
                    return Err(DecodeError::BadHeaderValue(
                        "zle_skip",
                        (self.buffer.len() + run) as u64,
                    ));
                }
                self.buffer.push_run(control.baseline, run);
            } else {
                let (first, second) = unpack_samples(word);
                self.buffer.push(first);
                self.buffer.push(second);
            }
        }
        self.decoded = Some((idx, channel));
        Ok(Some(control.baseline))
    }
}

impl Decoder for ZleDecoder {
    fn format(&self) -> Format {
        Format::CaenZle
    }

    fn load(&mut self, data: &[u8]) -> Result<usize, DecodeError> {
        self.offsets = scan_events(data, blocks_are_consistent);
        self.cache.clear();
        self.decoded = None;
        self.fields.clear();
        self.fields
            .insert_input("n_events", ZleField::Input(self.offsets.len().into()));
        for (field, name) in HeaderField::ALL {
            self.fields.insert_event(name, ZleField::Header(field));
        }
        for ch in 0..CAEN_N_CHANNELS {
            self.fields.insert_event(
                &format!("ch_{ch}:raw_waveform"),
                ZleField::Channel(ch, ChannelField::Waveform),
            );
            self.fields.insert_event(
                &format!("ch_{ch}:baseline"),
                ZleField::Channel(ch, ChannelField::Baseline),
            );
            self.fields.insert_event(
                &format!("ch_{ch}:n_samples"),
                ZleField::Channel(ch, ChannelField::NSamples),
            );
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
            ZleField::Input(value) => Ok(Some(value)),
            ZleField::Header(h) => Ok(Some(h.value(&self.cache.get(data, &self.offsets, idx)?))),
            ZleField::Channel(ch, kind) => {
                let baseline = match self.expand(data, idx, ch)? {
                    Some(b) => b,
                    None => return Ok(None),
                };
                Ok(Some(match kind {
                    ChannelField::Waveform => Value::Waveform(self.buffer.to_waveform()),
                    ChannelField::Baseline => Value::Int(baseline as i64),
                    ChannelField::NSamples => self.buffer.len().into(),
                }))
            }
        }
    }
}
