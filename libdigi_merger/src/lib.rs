//! # digi_merger
//!
//! digi_merger is a multi-digitizer event builder, written in Rust. It reads the files
//! written by several independent waveform digitizers, each in its own binary or text
//! layout, and presents them as one time-ordered stream of merged events.
//!
//! ## Supported formats
//!
//! The format of every file is determined by sniffing its leading bytes. The probes are
//! tried in a fixed order and the first match wins; a group can also force a format.
//!
//! - `bluetongue`: self-describing fixed layout binary. A header lists the boards, their
//! record lengths and channels, after which every event record has the same size and ends
//! with a check word.
//! - `caen_raw`: CAEN 1730 standard firmware, uncompressed.
//! - `caen_zle`: CAEN 1730 standard firmware with zero-length encoding. Suppressed runs
//! of samples are expanded back to the channel baseline.
//! - `caen_psd`: CAEN 1730 DPP-PSD firmware. Per-channel sub-events are merged into events
//! by a coincidence window, where every channel may appear only once per event.
//! - `wavedump` / `wavedump742`: the CAEN WaveDump text output, with a configurable label
//! layout.
//!
//! ## Inputs, groups and streams
//!
//! A group is one named input of the merge. It contains one or more streams which are read
//! in lockstep: each stream is a chain of files, and files with the same position in every
//! chain must contain the same number of events. Event indices keep counting across file
//! boundaries, and empty files are skipped.
//!
//! ## Event building
//!
//! In `timestamp` mode, the earliest pending sub-event of any group opens a new event.
//! Every group whose current timestamp lies within `window` of the latest claimed sub-event
//! joins it, and the window keeps extending until no group can join. Each group contributes
//! at most one sub-event to an event. In `parallel` mode, the n-th sub-event of every group
//! forms the n-th event.
//!
//! Event data is published into a two-zone key value store. Per-event keys start with
//! `EVENT:` and are cleared for every event; file headers start with `INPUT:` and persist.
//! Keys are formatted as `EVENT:<group>:<field>` (or `EVENT:<group>:<label>:<field>` for
//! labelled streams). Fields are decoded lazily on the first read of an event.
//! The builder adds `EVENT:index`, `EVENT:time`, `EVENT:time_max` and `EVENT:groups`, and
//! for each group in the event `EVENT:<group>:time` (its timestamp scaled by `tick`) and
//! `EVENT:<group>:index`.
//!
//! ## Configuration
//!
//! The YAML format of a configuration file is as follows:
//!
//! ```yml
//! groups:
//!   - name: psd
//!     format: caen_psd
//!     coincidence_window: 40
//!     tick: 2
//!     streams:
//!       - directory: /data/run_0012
//!         prefix: psd_
//!         suffix: .dat
//!   - name: scope
//!     streams:
//!       - label: top
//!         files: [/data/top_0.bt, /data/top_1.bt]
//!       - label: bottom
//!         files: [/data/bottom_0.bt, /data/bottom_1.bt]
//! mode: timestamp
//! window: 100
//! first_event: 0
//! max_events: null
//! keys:
//!   - EVENT:time
//!   - EVENT:scope:top:board_0:raw_waveform_ch_3
//! ```
//!
//! `tick` converts the native timestamp unit of a group into the common time base used by
//! `window`.
pub mod bluetongue;
pub mod buffer;
pub mod caen;
pub mod caen_psd;
pub mod caen_raw;
pub mod caen_zle;
pub mod channel;
pub mod config;
pub mod constants;
pub mod error;
pub mod event_builder;
pub mod field;
pub mod format;
pub mod group;
pub mod process;
pub mod store;
pub mod wavedump;
