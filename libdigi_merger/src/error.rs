use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("DataStore cannot put transient key {0} because it is already saved as permanent")]
    LifetimeConflict(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Data ended at byte {offset} while {needed} more bytes were required")]
    Truncated { offset: usize, needed: usize },
    #[error("Header field {0} has an implausible value {1}")]
    BadHeaderValue(&'static str, u64),
    #[error("Invalid header word 0x{word:08X} found at byte {offset}")]
    BadHeaderWord { word: u32, offset: usize },
    #[error("Event index {idx} is outside of the {n_events} events in this file")]
    BadEventIndex { idx: usize, n_events: usize },
    #[error("Payload of {words} words cannot be divided evenly among {channels} channels")]
    UnevenPayload { words: usize, channels: usize },
    #[error("Text label {0:?} was not found in the event")]
    MissingLabel(String),
    #[error("Text structure is missing the required field {0}")]
    MissingStructureField(&'static str),
    #[error("Failed to parse text value {0:?} as an integer")]
    BadTextValue(String),
    #[error("Zero-length encoding requires an even number of samples, found {0}")]
    OddSampleCount(usize),
    #[error("Decoder was used before its header was loaded")]
    NotLoaded,
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("No reader could be determined for file {0:?}; it does not match any known format")]
    Undetermined(PathBuf),
    #[error("Format {format} could not decode file {path:?}: {source}")]
    Decode {
        format: String,
        path: PathBuf,
        source: DecodeError,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Could not open StreamChannel because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("StreamChannel failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("StreamChannel failed to determine a format: {0}")]
    FormatError(#[from] FormatError),
    #[error("StreamChannel failed to decode an event: {0}")]
    DecodeError(#[from] DecodeError),
    #[error("StreamChannel for file {0:?} was used before it was loaded")]
    NotLoaded(PathBuf),
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("Group {0} was given no files")]
    NoFiles(String),
    #[error("Group {group} has streams with different numbers of files: {counts:?}")]
    MismatchedFileChains { group: String, counts: Vec<usize> },
    #[error("Group {group} has channels with different event counts in file index {file}: {counts:?}")]
    MismatchedEventCounts {
        group: String,
        file: usize,
        counts: Vec<usize>,
    },
    #[error("Group {group} cannot seek backward to event {requested}; the current file starts at event {file_start}")]
    BackwardSeek {
        group: String,
        requested: usize,
        file_start: usize,
    },
    #[error("Group {group} has no stream labelled {label}")]
    UnknownStream { group: String, label: String },
    #[error("Group failed due to StreamChannel error: {0}")]
    ChannelError(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum EventBuilderError {
    #[error("EventBuilder was given no inputs")]
    NoInputs,
    #[error("EventBuilder was given two inputs named {0}")]
    DuplicateInput(String),
    #[error("EventBuilder in timestamp mode cannot seek backward from event {current} to event {requested}")]
    BackwardSeek { current: usize, requested: usize },
    #[error("EventBuilder failed due to group error: {0}")]
    GroupError(#[from] GroupError),
    #[error("EventBuilder failed due to store error: {0}")]
    StoreError(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is missing required parameter: {0}")]
    MissingParameter(String),
    #[error("Config defines group {0} more than once")]
    DuplicateGroup(String),
    #[error("Config for group {0} gives a stream with both explicit files and a directory")]
    AmbiguousStream(String),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Group error: {0}")]
    GroupError(#[from] GroupError),
    #[error("Processor failed due to EventBuilder error: {0}")]
    EVBError(#[from] EventBuilderError),
    #[error("Processor failed to convert to yaml: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}
