use fxhash::FxHashMap;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::error::ChannelError;
use super::field::FieldId;
use super::format::{Decoder, DecoderSpec, Format};
use super::store::{Value, INPUT_PREFIX};

/// StreamChannel wraps one data file and the decoder that understands it.
///
/// The file is memory mapped on `load` and released on `offload`. The channel moves
/// forward through the file by local index; a local index of `None` means the channel
/// has run past its last event.
#[derive(Debug)]
pub struct StreamChannel {
    path: PathBuf,
    spec: DecoderSpec,
    mmap: Option<Mmap>,
    decoder: Option<Box<dyn Decoder>>,
    field_cache: FxHashMap<String, Option<FieldId>>,
    idx: Option<usize>,
    n_events: usize,
    size_bytes: u64,
    timestamp: Option<u64>,
}

impl StreamChannel {
    /// Create a closed channel for the file at `path`
    pub fn new(path: &Path, spec: DecoderSpec) -> Self {
        Self {
            path: path.to_path_buf(),
            spec,
            mmap: None,
            decoder: None,
            field_cache: FxHashMap::default(),
            idx: None,
            n_events: 0,
            size_bytes: 0,
            timestamp: None,
        }
    }

    /// Map the file, determine its format and count its events.
    ///
    /// The channel is left at local index 0 (or exhausted if the file has no events).
    pub fn load(&mut self) -> Result<usize, ChannelError> {
        if !self.path.exists() {
            return Err(ChannelError::BadFilePath(self.path.clone()));
        }
        self.offload();
        let file = File::open(&self.path)?;
        self.size_bytes = file.metadata()?.len();
        if self.size_bytes == 0 {
            log::warn!("File {} is empty", self.path.to_string_lossy());
            return Ok(0);
        }

        // SAFETY: The mapping is read-only and owned by this channel alone. Data files are
        // not modified while they are being merged.
        let mmap = unsafe { Mmap::map(&file)? };
        let (decoder, n_events) = self.spec.open(&mmap, &self.path)?;
        log::info!(
            "Opened {} ({}) as {} with {} events",
            self.path.to_string_lossy(),
            human_bytes::human_bytes(self.size_bytes as f64),
            decoder.format(),
            n_events
        );
        self.mmap = Some(mmap);
        self.decoder = Some(decoder);
        self.n_events = n_events;
        self.set_idx(0)?;
        Ok(n_events)
    }

    /// Release the mapping and the decoder
    pub fn offload(&mut self) {
        self.mmap = None;
        self.decoder = None;
        self.field_cache.clear();
        self.idx = None;
        self.n_events = 0;
        self.timestamp = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.mmap.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Option<Format> {
        self.decoder.as_ref().map(|d| d.format())
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn idx(&self) -> Option<usize> {
        self.idx
    }

    /// Timestamp of the current event in the format's native unit
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Move to local index `idx`. Returns `None` (and leaves the channel exhausted) if the
    /// index is past the end of the file.
    pub fn set_idx(&mut self, idx: usize) -> Result<Option<usize>, ChannelError> {
        if idx >= self.n_events {
            self.idx = None;
            self.timestamp = None;
            return Ok(None);
        }
        let (decoder, mmap) = match (self.decoder.as_mut(), self.mmap.as_ref()) {
            (Some(d), Some(m)) => (d, m),
            _ => return Err(ChannelError::NotLoaded(self.path.clone())),
        };
        self.timestamp = Some(decoder.timestamp(mmap, idx)?);
        self.idx = Some(idx);
        Ok(self.idx)
    }

    pub fn set_next_event(&mut self) -> Result<Option<usize>, ChannelError> {
        match self.idx {
            Some(idx) => self.set_idx(idx + 1),
            None => Ok(None),
        }
    }

    /// Decode a field of the current event, e.g. `EVENT:board_0:raw_waveform_ch_1`.
    ///
    /// Header (`INPUT:`) fields are available as long as the file is loaded. Unknown
    /// paths and fields without data return `None`.
    pub fn read(&mut self, path: &str) -> Result<Option<Value>, ChannelError> {
        let (decoder, mmap) = match (self.decoder.as_mut(), self.mmap.as_ref()) {
            (Some(d), Some(m)) => (d, m),
            _ => return Ok(None),
        };
        let idx = match self.idx {
            Some(idx) => idx,
            None if path.starts_with(INPUT_PREFIX) => 0,
            None => return Ok(None),
        };
        let id = match self.field_cache.get(path) {
            Some(id) => *id,
            None => {
                let id = decoder.resolve(path);
                self.field_cache.insert(path.to_string(), id);
                id
            }
        };
        match id {
            Some(id) => Ok(decoder.read(mmap, idx, id)?),
            None => Ok(None),
        }
    }

    pub fn field_names(&self) -> Vec<String> {
        self.decoder
            .as_ref()
            .map(|d| d.field_names())
            .unwrap_or_default()
    }

    /// Every header field of the file, without the `INPUT:` prefix
    pub fn header(&mut self) -> Result<Vec<(String, Value)>, ChannelError> {
        let mut values = Vec::new();
        for name in self.field_names() {
            if let Some(field) = name.strip_prefix(INPUT_PREFIX) {
                if let Some(value) = self.read(&name)? {
                    values.push((field.to_string(), value));
                }
            }
        }
        Ok(values)
    }
}
