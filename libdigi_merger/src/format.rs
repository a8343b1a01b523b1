use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;

use super::bluetongue::BlueTongueDecoder;
use super::caen_psd::PsdDecoder;
use super::caen_raw::RawDecoder;
use super::caen_zle::ZleDecoder;
use super::error::{DecodeError, FormatError};
use super::field::FieldId;
use super::store::Value;
use super::wavedump::{TextStructure, WaveDumpDecoder};
use super::{bluetongue, caen_psd, caen_raw, caen_zle, wavedump};

/// The digitizer layouts understood by the merger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    #[serde(rename = "bluetongue")]
    BlueTongue,
    #[serde(rename = "caen_raw")]
    CaenRaw,
    #[serde(rename = "caen_zle")]
    CaenZle,
    #[serde(rename = "caen_psd")]
    CaenPsd,
    #[serde(rename = "wavedump")]
    WaveDump,
    #[serde(rename = "wavedump742")]
    WaveDump742,
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BlueTongue => "BlueTongue",
            Self::CaenRaw => "CAEN RAW",
            Self::CaenZle => "CAEN ZLE",
            Self::CaenPsd => "CAEN PSD",
            Self::WaveDump => "WaveDump",
            Self::WaveDump742 => "WaveDump742",
        };
        write!(f, "{name}")
    }
}

/// A Decoder turns the bytes of one mapped file into addressable events.
///
/// Decoders never own the file; the StreamChannel hands them the mapped bytes on every
/// call. `load` must be called once before anything else.
pub trait Decoder: std::fmt::Debug {
    fn format(&self) -> Format;

    /// Parse the file level structure and count the events
    fn load(&mut self, data: &[u8]) -> Result<usize, DecodeError>;

    fn n_events(&self) -> usize;

    /// Resolve an `EVENT:` or `INPUT:` path into a field handle
    fn resolve(&self, path: &str) -> Option<FieldId>;

    /// Every path this decoder can resolve
    fn field_names(&self) -> Vec<String>;

    /// Timestamp of event `idx` in the format's native unit
    fn timestamp(&mut self, data: &[u8], idx: usize) -> Result<u64, DecodeError>;

    /// Decode one field of event `idx`. `None` means the field has no data in this event.
    fn read(&mut self, data: &[u8], idx: usize, field: FieldId)
        -> Result<Option<Value>, DecodeError>;
}

type Probe = fn(&[u8]) -> bool;

/// Probes in the order they are tried; the first match wins
const PROBES: [(Format, Probe); 6] = [
    (Format::BlueTongue, bluetongue::sniff),
    (Format::CaenPsd, caen_psd::sniff),
    (Format::CaenZle, caen_zle::sniff),
    (Format::CaenRaw, caen_raw::sniff),
    (Format::WaveDump742, wavedump::sniff_742),
    (Format::WaveDump, wavedump::sniff),
];

/// Determine the format of a file from its leading bytes
pub fn sniff(data: &[u8]) -> Option<Format> {
    PROBES
        .iter()
        .find(|(_, probe)| probe(data))
        .map(|(format, _)| *format)
}

/// Everything needed to build a decoder for one file of a group
#[derive(Debug, Clone, Default)]
pub struct DecoderSpec {
    pub format: Option<Format>,
    pub structure: Option<TextStructure>,
    pub coincidence_window: u64,
}

impl DecoderSpec {
    /// Build and load a decoder for the mapped bytes of the file at `path`.
    ///
    /// Returns the decoder and the number of events it found.
    pub fn open(
        &self,
        data: &[u8],
        path: &Path,
    ) -> Result<(Box<dyn Decoder>, usize), FormatError> {
        let format = match self.format {
            Some(f) => f,
            None => sniff(data).ok_or_else(|| FormatError::Undetermined(path.to_path_buf()))?,
        };
        let mut decoder: Box<dyn Decoder> = match format {
            Format::BlueTongue => Box::new(BlueTongueDecoder::new()),
            Format::CaenRaw => Box::new(RawDecoder::new()),
            Format::CaenZle => Box::new(ZleDecoder::new()),
            Format::CaenPsd => Box::new(PsdDecoder::new(self.coincidence_window)),
            Format::WaveDump => Box::new(WaveDumpDecoder::new(
                self.structure
                    .clone()
                    .unwrap_or_else(TextStructure::wavedump),
            )),
            Format::WaveDump742 => Box::new(WaveDumpDecoder::new(
                self.structure
                    .clone()
                    .unwrap_or_else(TextStructure::wavedump742),
            )),
        };
        let n_events = decoder.load(data).map_err(|e| FormatError::Decode {
            format: format.to_string(),
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok((decoder, n_events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetongue::tests::{bluetongue_file, BoardLayout};
    use crate::caen_raw::tests::raw_event;
    use crate::caen_zle::tests::zle_event;
    use std::path::PathBuf;

    #[test]
    fn test_sniff_each_format() {
        let bt = bluetongue_file(&[BoardLayout::new("b0", "CAEN1730", 4, &[0, 1])], 2);
        assert_eq!(sniff(&bt), Some(Format::BlueTongue));

        let raw = raw_event(0, 0b11, 1, 100, &[vec![1, 2], vec![3, 4]]);
        assert_eq!(sniff(&raw), Some(Format::CaenRaw));

        let zle = zle_event(0, 0b1, 1, 100, &[(10, vec![10, 10, 5, 6])]);
        assert_eq!(sniff(&zle), Some(Format::CaenZle));

        let text = b"Record Length: 2\nBoardID: 0\nChannel: 0\nEvent Number: 0\nPattern: 0x0000\nTrigger Time Stamp: 10\nDC offset (DAC): 0x1999\n1\n2\n";
        assert_eq!(sniff(text), Some(Format::WaveDump));
    }

    #[test]
    fn test_undetermined_is_distinct() {
        let spec = DecoderSpec::default();
        let result = spec.open(b"not a digitizer file", &PathBuf::from("junk.dat"));
        assert!(matches!(result, Err(FormatError::Undetermined(_))));
    }

    #[test]
    fn test_explicit_format_reports_decode_error() {
        let spec = DecoderSpec {
            format: Some(Format::BlueTongue),
            ..Default::default()
        };
        let result = spec.open(&[1, 0], &PathBuf::from("short.bt"));
        assert!(matches!(result, Err(FormatError::Decode { .. })));
    }
}
