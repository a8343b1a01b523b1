// BlueTongue
pub const BT_CHECK_WORD: u16 = 65226;
pub const BT_CAEN1743_TYPE: &str = "CAEN1743";
// Sanity bounds used when sniffing a BlueTongue header
pub const BT_MAX_BOARDS: u32 = 64;
pub const BT_MAX_NAME_LEN: u32 = 256;
pub const BT_MAX_CHANNELS: u32 = 64;
pub const BT_MAX_RECORD_LENGTH: u32 = 1 << 20;

// CAEN 1730 event / board aggregate header
pub const CAEN_WORD_SIZE: usize = 4;
pub const CAEN_HEADER_WORDS: usize = 4;
pub const CAEN_N_CHANNELS: usize = 16;
pub const CAEN_SYNC_MASK: u32 = 0xF000_0000;
pub const CAEN_SYNC_PATTERN: u32 = 0xA000_0000;
pub const CAEN_EVENT_SIZE_MASK: u32 = 0x0FFF_FFFF;
pub const CAEN_BOARD_ID_MASK: u32 = 0xF800_0000;
pub const CAEN_BOARD_ID_SHIFT: u32 = 27;
pub const CAEN_BOARD_FAIL_MASK: u32 = 0x0400_0000;
pub const CAEN_ZLE_FLAG_MASK: u32 = 0x0100_0000;
pub const CAEN_PATTERN_MASK: u32 = 0x00FF_FF00;
pub const CAEN_PATTERN_SHIFT: u32 = 8;
pub const CAEN_CHANNEL_MASK_LOW: u32 = 0x0000_00FF;
pub const CAEN_CHANNEL_MASK_HIGH: u32 = 0xFF00_0000;
pub const CAEN_CHANNEL_MASK_HIGH_SHIFT: u32 = 24;
pub const CAEN_EVENT_COUNTER_MASK: u32 = 0x00FF_FFFF;
pub const CAEN_TRIGGER_TIME_MASK: u32 = 0x7FFF_FFFF;
pub const CAEN_SAMPLE_MASK: u32 = 0x3FFF;
pub const CAEN_UPPER_SAMPLE_SHIFT: u32 = 16;

// CAEN 1730 zero-length encoding
pub const ZLE_BASELINE_MASK: u32 = 0x3FFF_0000;
pub const ZLE_BASELINE_SHIFT: u32 = 16;
pub const ZLE_LENGTH_MASK: u32 = 0x0000_FFFF;
pub const ZLE_SKIP_FLAG_MASK: u32 = 0xF000_0000;
pub const ZLE_SKIP_FLAG: u32 = 0x8000_0000;
pub const ZLE_SKIP_COUNT_MASK: u32 = 0x0FFF_FFFF;
pub const ZLE_SAMPLES_PER_SKIP: usize = 2;
// Largest 1730 channel memory, 5.12 MS
pub const ZLE_MAX_SAMPLES: usize = 5_242_880;

// CAEN 1730 DPP-PSD
pub const PSD_COUPLE_MASK: u32 = 0x0000_00FF;
pub const PSD_AGGREGATE_COUNTER_MASK: u32 = 0x007F_FFFF;
pub const PSD_CHANNEL_AGG_FLAG: u32 = 0x8000_0000;
pub const PSD_CHANNEL_AGG_SIZE_MASK: u32 = 0x003F_FFFF;
pub const PSD_CHANNEL_AGG_HEADER_WORDS: usize = 2;
pub const PSD_NSAMPLES_MASK: u32 = 0x0000_FFFF;
pub const PSD_SAMPLES_PER_UNIT: usize = 8;
pub const PSD_WAVEFORM_FLAG: u32 = 0x0800_0000;
pub const PSD_EXTRAS_FLAG: u32 = 0x1000_0000;
pub const PSD_ODD_CHANNEL_FLAG: u32 = 0x8000_0000;
pub const PSD_TRIGGER_TIME_MASK: u32 = 0x7FFF_FFFF;
pub const PSD_TRIGGER_TIME_BITS: u32 = 31;
pub const PSD_EXTENDED_TIME_MASK: u32 = 0xFFFF_0000;
pub const PSD_EXTENDED_TIME_SHIFT: u32 = 16;
pub const PSD_FINE_TIME_MASK: u32 = 0x0000_03FF;
pub const PSD_CHARGE_LONG_MASK: u32 = 0xFFFF_0000;
pub const PSD_CHARGE_LONG_SHIFT: u32 = 16;
pub const PSD_PILEUP_MASK: u32 = 0x0000_8000;
pub const PSD_CHARGE_SHORT_MASK: u32 = 0x0000_7FFF;

// WaveDump text
pub const WD_HEX_PREFIX: &str = "0x";
