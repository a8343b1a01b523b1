use std::path::PathBuf;

use super::channel::StreamChannel;
use super::error::GroupError;
use super::event_builder::EventSource;
use super::format::DecoderSpec;
use super::store::{Value, EVENT_PREFIX, INPUT_PREFIX};

/// One stream of a group: an optional label and the ordered chain of files it reads
#[derive(Debug, Clone, Default)]
pub struct StreamSource {
    pub label: Option<String>,
    pub files: Vec<PathBuf>,
}

/// GroupedInput advances several streams in lockstep so that their channels always sit at
/// the same event index.
///
/// Each stream owns a chain of files. Files with the same position in every chain are read
/// together and must contain the same number of events. The group keeps a global index that
/// keeps counting across file boundaries; empty files are skipped.
#[derive(Debug)]
pub struct GroupedInput {
    name: String,
    labels: Vec<Option<String>>,
    chains: Vec<Vec<PathBuf>>,
    spec: DecoderSpec,
    tick: u64,
    channels: Vec<StreamChannel>,
    f_idx: usize,
    file_start: usize,
    file_counts: Vec<Option<usize>>,
}

impl GroupedInput {
    /// Create the group and open the first file that contains events.
    ///
    /// `tick` converts the native timestamp unit of the format into the common time base.
    pub fn new(
        name: &str,
        streams: Vec<StreamSource>,
        spec: DecoderSpec,
        tick: u64,
    ) -> Result<Self, GroupError> {
        if streams.is_empty() || streams.iter().any(|s| s.files.is_empty()) {
            return Err(GroupError::NoFiles(name.to_string()));
        }
        let counts: Vec<usize> = streams.iter().map(|s| s.files.len()).collect();
        if counts.iter().any(|c| *c != counts[0]) {
            return Err(GroupError::MismatchedFileChains {
                group: name.to_string(),
                counts,
            });
        }
        let n_files = counts[0];
        let (labels, chains): (Vec<Option<String>>, Vec<Vec<PathBuf>>) =
            streams.into_iter().map(|s| (s.label, s.files)).unzip();

        let mut group = Self {
            name: name.to_string(),
            labels,
            chains,
            spec,
            tick: tick.max(1),
            channels: Vec::new(),
            f_idx: 0,
            file_start: 0,
            file_counts: vec![None; n_files],
        };

        let mut f = 0;
        while group.open_file(f)? == 0 && f + 1 < n_files {
            log::warn!("Group {} skipping file index {f}, it has no events", group.name);
            f += 1;
        }
        Ok(group)
    }

    pub fn n_files(&self) -> usize {
        self.file_counts.len()
    }

    pub fn n_streams(&self) -> usize {
        self.chains.len()
    }

    /// Open file `f` of every stream, replacing the current channels
    fn open_file(&mut self, f: usize) -> Result<usize, GroupError> {
        for channel in self.channels.iter_mut() {
            channel.offload();
        }
        let mut channels = Vec::with_capacity(self.chains.len());
        let mut counts = Vec::with_capacity(self.chains.len());
        let mut size_bytes = 0;
        for chain in self.chains.iter() {
            let mut channel = StreamChannel::new(&chain[f], self.spec.clone());
            counts.push(channel.load()?);
            size_bytes += channel.size_bytes();
            channels.push(channel);
        }
        if counts.iter().any(|c| *c != counts[0]) {
            return Err(GroupError::MismatchedEventCounts {
                group: self.name.clone(),
                file: f,
                counts,
            });
        }
        log::info!(
            "Group {} opened file index {f}: {} stream(s), {}, {} events",
            self.name,
            channels.len(),
            human_bytes::human_bytes(size_bytes as f64),
            counts[0]
        );
        self.channels = channels;
        self.f_idx = f;
        self.file_counts[f] = Some(counts[0]);
        Ok(counts[0])
    }

    /// Event count of file `f`, probed from the first stream without disturbing the open files
    fn file_count(&mut self, f: usize) -> Result<usize, GroupError> {
        if let Some(count) = self.file_counts[f] {
            return Ok(count);
        }
        let mut probe = StreamChannel::new(&self.chains[0][f], self.spec.clone());
        let count = probe.load()?;
        probe.offload();
        self.file_counts[f] = Some(count);
        Ok(count)
    }

    fn local_idx(&self) -> Option<usize> {
        self.channels.first().and_then(|c| c.idx())
    }

    /// Split a group-relative path into the stream it addresses and the channel path
    fn route(&self, path: &str) -> Result<Option<(usize, String)>, GroupError> {
        let (prefix, rest) = if let Some(rest) = path.strip_prefix(EVENT_PREFIX) {
            (EVENT_PREFIX, rest)
        } else if let Some(rest) = path.strip_prefix(INPUT_PREFIX) {
            (INPUT_PREFIX, rest)
        } else {
            return Ok(None);
        };
        if self.labels.iter().all(|l| l.is_none()) {
            return Ok(Some((0, path.to_string())));
        }
        let (label, field) = match rest.split_once(':') {
            Some(split) => split,
            None => return Ok(None),
        };
        match self
            .labels
            .iter()
            .position(|l| l.as_deref() == Some(label))
        {
            Some(s) => Ok(Some((s, format!("{prefix}{field}")))),
            None => Err(GroupError::UnknownStream {
                group: self.name.clone(),
                label: label.to_string(),
            }),
        }
    }

    fn stream_prefix(&self, stream: usize) -> String {
        match &self.labels[stream] {
            Some(label) => format!("{label}:"),
            None => String::new(),
        }
    }
}

impl EventSource for GroupedInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn timestamp(&self) -> Option<u64> {
        self.channels
            .first()
            .and_then(|c| c.timestamp())
            .map(|t| t.saturating_mul(self.tick))
    }

    fn global_idx(&self) -> Option<usize> {
        self.local_idx().map(|local| self.file_start + local)
    }

    fn file_index(&self) -> usize {
        self.f_idx
    }

    fn set_next_event(&mut self) -> Result<Option<usize>, GroupError> {
        if self.local_idx().is_none() {
            return Ok(None);
        }
        let mut results = Vec::with_capacity(self.channels.len());
        for channel in self.channels.iter_mut() {
            results.push(channel.set_next_event()?);
        }
        if results.iter().all(|r| r.is_some()) {
            return Ok(self.global_idx());
        }
        if results.iter().any(|r| r.is_some()) {
            return Err(GroupError::MismatchedEventCounts {
                group: self.name.clone(),
                file: self.f_idx,
                counts: self.channels.iter().map(|c| c.n_events()).collect(),
            });
        }

        // Every channel reached the end of its file: move the chain forward
        let start = self.file_start + self.file_count(self.f_idx)?;
        for f in (self.f_idx + 1)..self.n_files() {
            let count = self.open_file(f)?;
            self.file_start = start;
            if count > 0 {
                return Ok(self.global_idx());
            }
            log::warn!("Group {} skipping file index {f}, it has no events", self.name);
        }
        log::info!("Group {} reached the end of its data", self.name);
        Ok(None)
    }

    fn set_idx(&mut self, idx: usize) -> Result<Option<usize>, GroupError> {
        if idx < self.file_start {
            return Err(GroupError::BackwardSeek {
                group: self.name.clone(),
                requested: idx,
                file_start: self.file_start,
            });
        }
        let mut f = self.f_idx;
        let mut start = self.file_start;
        loop {
            let count = self.file_count(f)?;
            if idx < start + count {
                break;
            }
            start += count;
            f += 1;
            if f >= self.n_files() {
                return Ok(None);
            }
        }
        if f != self.f_idx {
            self.open_file(f)?;
            self.file_start = start;
        }
        for channel in self.channels.iter_mut() {
            channel.set_idx(idx - start)?;
        }
        Ok(self.global_idx())
    }

    fn read(&mut self, path: &str) -> Result<Option<Value>, GroupError> {
        match self.route(path)? {
            Some((stream, channel_path)) => Ok(self.channels[stream].read(&channel_path)?),
            None => Ok(None),
        }
    }

    fn header(&mut self) -> Result<Vec<(String, Value)>, GroupError> {
        let mut values = vec![
            (String::from("file_index"), Value::from(self.f_idx)),
            (String::from("n_files"), Value::from(self.n_files())),
            (String::from("tick"), Value::from(self.tick)),
        ];
        for stream in 0..self.channels.len() {
            let prefix = self.stream_prefix(stream);
            let channel = &mut self.channels[stream];
            values.push((
                format!("{prefix}file"),
                Value::from(channel.path().to_string_lossy().to_string()),
            ));
            if let Some(format) = channel.format() {
                values.push((format!("{prefix}format"), Value::from(format.to_string())));
            }
            for (field, value) in channel.header()? {
                values.push((format!("{prefix}{field}"), value));
            }
        }
        Ok(values)
    }

    fn field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (stream, channel) in self.channels.iter().enumerate() {
            let prefix = self.stream_prefix(stream);
            for name in channel.field_names() {
                if let Some(field) = name.strip_prefix(EVENT_PREFIX) {
                    names.push(format!("{prefix}{field}"));
                }
            }
        }
        names
    }

    fn total_events(&mut self) -> Result<usize, GroupError> {
        let mut total = 0;
        for f in 0..self.n_files() {
            total += self.file_count(f)?;
        }
        Ok(total)
    }
}
