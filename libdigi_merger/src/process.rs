use fxhash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use super::config::Config;
use super::error::ProcessorError;
use super::event_builder::{EventBuilder, EventSource};
use super::group::GroupedInput;
use super::store::Value;

/// What a run looked like once every event was pulled
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub n_events: usize,
    /// Number of events each group took part in
    pub group_counts: BTreeMap<String, usize>,
    /// Events built from more than one group
    pub coincidences: usize,
    /// Configured keys which had no value in an event
    pub missing_values: usize,
    pub first_time: Option<u64>,
    pub last_time: Option<u64>,
}

/// Open every configured group
pub fn build_inputs(config: &Config) -> Result<Vec<Box<dyn EventSource>>, ProcessorError> {
    let mut inputs: Vec<Box<dyn EventSource>> = Vec::with_capacity(config.groups.len());
    for group in config.groups.iter() {
        let sources = config.group_sources(group)?;
        log::info!(
            "Group {}: {} stream(s) of {} file(s), tick {}",
            group.name,
            sources.len(),
            sources.first().map(|s| s.files.len()).unwrap_or(0),
            group.tick
        );
        inputs.push(Box::new(GroupedInput::new(
            &group.name,
            sources,
            config.decoder_spec(group),
            group.tick,
        )?));
    }
    Ok(inputs)
}

/// Validate the config, open the groups and position the builder at `first_event`
pub fn build_event_builder(config: &Config) -> Result<EventBuilder, ProcessorError> {
    config.validate()?;
    let mut evb = EventBuilder::new(build_inputs(config)?, config.mode, config.window)?;
    if config.first_event > 0 {
        let skipped = evb.skip_events(config.first_event)?;
        log::info!("Skipped {skipped} events");
    }
    Ok(evb)
}

fn set_progress(progress: &Arc<Mutex<f32>>, value: f32) {
    match progress.lock() {
        Ok(mut p) => *p = value,
        Err(e) => log::error!("Could not update progress: {e}"),
    }
}

/// The main loop of digi_merger.
///
/// Pulls merged events until the inputs run out or `max_events` is reached, reading the
/// configured keys of every event. Progress is reported as the fraction of sub-events
/// consumed.
pub fn process(config: Config, progress: Arc<Mutex<f32>>) -> Result<RunSummary, ProcessorError> {
    log::info!(
        "Total input size: {}",
        human_bytes::human_bytes(config.total_data_size()? as f64)
    );
    let mut evb = build_event_builder(&config)?;
    let total_sub_events = evb.total_sub_events()?.max(1);
    let flush_frac: f32 = 0.01;
    let flush_val = ((total_sub_events as f64 * flush_frac as f64) as usize).max(1);
    let mut consumed = 0;
    let mut since_flush = 0;

    let mut summary = RunSummary::default();
    let mut group_counts: FxHashMap<String, usize> = FxHashMap::default();
    set_progress(&progress, 0.0);
    while config.max_events.map_or(true, |max| summary.n_events < max) && evb.get_event()? {
        let groups = evb.groups_in_event();
        for group in groups.iter() {
            *group_counts.entry(group.to_string()).or_default() += 1;
        }
        if groups.len() > 1 {
            summary.coincidences += 1;
        }
        consumed += groups.len();
        since_flush += groups.len();

        for key in config.keys.iter() {
            if evb.read(key)?.is_none() {
                summary.missing_values += 1;
            }
        }
        if summary.first_time.is_none() {
            summary.first_time = evb.event_time();
        }
        summary.last_time = evb.event_time();
        summary.n_events += 1;

        if since_flush >= flush_val {
            since_flush = 0;
            set_progress(&progress, consumed as f32 / total_sub_events as f32);
        }
    }
    set_progress(&progress, 1.0);

    summary.group_counts = group_counts.into_iter().collect();
    log::info!("Built {} events", summary.n_events);
    for (group, count) in summary.group_counts.iter() {
        log::info!("Group {group} took part in {count} events");
    }
    log::info!(
        "{} events contained more than one group, {} requested values were missing",
        summary.coincidences,
        summary.missing_values
    );
    Ok(summary)
}

/// Write the configured keys of the first `n` events as YAML documents.
///
/// With no configured keys every per-event field of the participating groups is written.
pub fn dump_events<W: Write>(
    config: &Config,
    n: usize,
    sink: &mut W,
) -> Result<usize, ProcessorError> {
    let mut evb = build_event_builder(config)?;
    let mut written = 0;
    while written < n && evb.get_event()? {
        let keys = if config.keys.is_empty() {
            evb.event_keys()
        } else {
            config.keys.clone()
        };
        let mut values: BTreeMap<String, Option<Value>> = BTreeMap::new();
        for key in keys {
            let value = evb.read(&key)?.cloned();
            values.insert(key, value);
        }
        writeln!(sink, "--- # event {}", evb.current_idx().unwrap_or(written))?;
        sink.write_all(serde_yaml::to_string(&values)?.as_bytes())?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetongue::tests::{bluetongue_file_with_times, BoardLayout};
    use crate::config::{GroupConfig, StreamConfig};
    use crate::event_builder::BuildMode;
    use tempfile::TempDir;

    fn group(dir: &TempDir, name: &str, times: &[u32]) -> GroupConfig {
        let path = dir.path().join(format!("{name}.bt"));
        let boards = vec![BoardLayout::new(name, "CAEN1730", 2, &[0])];
        std::fs::write(&path, bluetongue_file_with_times(&boards, times)).unwrap();
        GroupConfig {
            name: name.to_string(),
            format: None,
            streams: vec![StreamConfig {
                files: vec![path],
                ..Default::default()
            }],
            tick: 1,
            coincidence_window: 0,
            structure: None,
        }
    }

    fn two_group_config(dir: &TempDir) -> Config {
        Config {
            groups: vec![group(dir, "a", &[10, 50]), group(dir, "b", &[11])],
            mode: BuildMode::Timestamp,
            window: 5,
            first_event: 0,
            max_events: None,
            keys: vec![
                String::from("EVENT:a:board_0:event_counter"),
                String::from("EVENT:b:timestamp"),
            ],
        }
    }

    #[test]
    fn test_process_summary() {
        let dir = TempDir::new().unwrap();
        let progress = Arc::new(Mutex::new(0.0));
        let summary = process(two_group_config(&dir), progress.clone()).unwrap();
        assert_eq!(summary.n_events, 2);
        assert_eq!(summary.coincidences, 1);
        assert_eq!(summary.group_counts.get("a"), Some(&2));
        assert_eq!(summary.group_counts.get("b"), Some(&1));
        // b is absent from the second event
        assert_eq!(summary.missing_values, 1);
        assert_eq!(summary.first_time, Some(10));
        assert_eq!(summary.last_time, Some(50));
        assert_eq!(*progress.lock().unwrap(), 1.0);
    }

    #[test]
    fn test_first_and_max_events() {
        let dir = TempDir::new().unwrap();
        let mut config = two_group_config(&dir);
        config.first_event = 1;
        let summary = process(config.clone(), Arc::new(Mutex::new(0.0))).unwrap();
        assert_eq!(summary.n_events, 1);
        assert_eq!(summary.first_time, Some(50));

        config.first_event = 0;
        config.max_events = Some(1);
        let summary = process(config, Arc::new(Mutex::new(0.0))).unwrap();
        assert_eq!(summary.n_events, 1);
    }

    #[test]
    fn test_dump_events() {
        let dir = TempDir::new().unwrap();
        let config = two_group_config(&dir);
        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(dump_events(&config, 5, &mut sink).unwrap(), 2);
        let text = String::from_utf8(sink).unwrap();
        assert!(text.contains("--- # event 0"));
        assert!(text.contains("--- # event 1"));
        assert_eq!(text.matches("EVENT:b:timestamp").count(), 2);
        assert!(text.contains("null"));
    }
}
