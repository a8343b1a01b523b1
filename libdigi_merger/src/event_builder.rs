use serde::{Deserialize, Serialize};

use super::error::{EventBuilderError, GroupError};
use super::store::{DataStore, Value, EVENT_PREFIX, GROUPS_KEY, INPUT_PREFIX};

/// The interface the EventBuilder pulls sub-events from.
///
/// Indices are global: they keep counting across the file chain of the source.
pub trait EventSource: std::fmt::Debug {
    fn name(&self) -> &str;
    /// Timestamp of the current sub-event in the common time base, `None` once exhausted
    fn timestamp(&self) -> Option<u64>;
    fn global_idx(&self) -> Option<usize>;
    fn file_index(&self) -> usize;
    fn set_next_event(&mut self) -> Result<Option<usize>, GroupError>;
    fn set_idx(&mut self, idx: usize) -> Result<Option<usize>, GroupError>;
    /// Decode a source-relative path such as `EVENT:board_0:timestamp`
    fn read(&mut self, path: &str) -> Result<Option<Value>, GroupError>;
    /// Header values of the currently open files, without the `INPUT:` prefix
    fn header(&mut self) -> Result<Vec<(String, Value)>, GroupError>;
    /// Per-event field names, without the `EVENT:` prefix
    fn field_names(&self) -> Vec<String>;
    fn total_events(&mut self) -> Result<usize, GroupError>;
}

/// How sub-events are combined into global events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Coincidence by timestamp within a sliding window
    #[default]
    Timestamp,
    /// Every input advances together; the n-th sub-events form the n-th event
    Parallel,
}

/// EventBuilder merges the sub-events of several inputs into global events.
///
/// In timestamp mode the earliest pending sub-event opens an event, and every input whose
/// current timestamp falls within `window` of the latest claimed sub-event joins it. Inputs
/// which join an event are advanced at the start of the following call to `get_event`, so
/// their data stays readable while the event is being analyzed.
///
/// Event data is published into a two-zone [`DataStore`]. Per-event values live in the
/// transient zone and are cleared by every `get_event`; `INPUT:` headers are permanent.
#[derive(Debug)]
pub struct EventBuilder {
    inputs: Vec<Box<dyn EventSource>>,
    mode: BuildMode,
    window: u64,
    store: DataStore,
    consumed: Vec<bool>,
    in_event: Vec<bool>,
    // Inputs left behind by a parallel seek past their end
    parked: Vec<bool>,
    file_seen: Vec<usize>,
    event_time: Option<u64>,
    event_time_max: Option<u64>,
    current_idx: Option<usize>,
    next_idx: usize,
}

impl EventBuilder {
    /// Create a new EventBuilder and save the headers of every input
    pub fn new(
        inputs: Vec<Box<dyn EventSource>>,
        mode: BuildMode,
        window: u64,
    ) -> Result<Self, EventBuilderError> {
        if inputs.is_empty() {
            return Err(EventBuilderError::NoInputs);
        }
        for (i, input) in inputs.iter().enumerate() {
            if inputs[..i].iter().any(|other| other.name() == input.name()) {
                return Err(EventBuilderError::DuplicateInput(input.name().to_string()));
            }
        }

        let n_inputs = inputs.len();
        let mut builder = Self {
            file_seen: inputs.iter().map(|i| i.file_index()).collect(),
            inputs,
            mode,
            window,
            store: DataStore::new(),
            consumed: vec![false; n_inputs],
            in_event: vec![false; n_inputs],
            parked: vec![false; n_inputs],
            event_time: None,
            event_time_max: None,
            current_idx: None,
            next_idx: 0,
        };
        let names: Vec<String> = builder.input_names().map(String::from).collect();
        builder.store.save(GROUPS_KEY, Value::Names(names));
        for i in 0..n_inputs {
            builder.save_header(i)?;
        }
        Ok(builder)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.name())
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Mutable access for downstream stages that publish derived values
    pub fn store_mut(&mut self) -> &mut DataStore {
        &mut self.store
    }

    /// Index of the current global event
    pub fn current_idx(&self) -> Option<usize> {
        self.current_idx
    }

    pub fn event_time(&self) -> Option<u64> {
        self.event_time
    }

    pub fn event_time_max(&self) -> Option<u64> {
        self.event_time_max
    }

    /// Names of the inputs that contributed to the current event
    pub fn groups_in_event(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .zip(self.in_event.iter())
            .filter(|(_, in_event)| **in_event)
            .map(|(input, _)| input.name())
            .collect()
    }

    /// Per-event field keys (`EVENT:<group>:<field>`) of the inputs in the current event
    pub fn event_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for (input, _) in self
            .inputs
            .iter()
            .zip(self.in_event.iter())
            .filter(|(_, in_event)| **in_event)
        {
            for field in input.field_names() {
                keys.push(format!("{EVENT_PREFIX}{}:{field}", input.name()));
            }
        }
        keys
    }

    /// Sum of the event counts of every input
    pub fn total_sub_events(&mut self) -> Result<usize, EventBuilderError> {
        let mut total = 0;
        for input in self.inputs.iter_mut() {
            total += input.total_events()?;
        }
        Ok(total)
    }

    fn save_header(&mut self, i: usize) -> Result<(), EventBuilderError> {
        let name = self.inputs[i].name().to_string();
        for (field, value) in self.inputs[i].header()? {
            self.store
                .save(&format!("{INPUT_PREFIX}{name}:{field}"), value);
        }
        self.file_seen[i] = self.inputs[i].file_index();
        Ok(())
    }

    /// Move to the next global event. Returns `false` once every input is exhausted.
    pub fn get_event(&mut self) -> Result<bool, EventBuilderError> {
        for i in 0..self.inputs.len() {
            if self.consumed[i] {
                self.inputs[i].set_next_event()?;
                self.consumed[i] = false;
            }
        }
        self.assemble()
    }

    /// Claim the sub-events at the current input positions and publish the event
    fn assemble(&mut self) -> Result<bool, EventBuilderError> {
        self.store.clear_transient();
        self.in_event.fill(false);
        self.event_time = None;
        self.event_time_max = None;
        for i in 0..self.inputs.len() {
            if self.inputs[i].file_index() != self.file_seen[i] {
                self.save_header(i)?;
            }
        }

        let times: Vec<Option<u64>> = self
            .inputs
            .iter()
            .zip(self.parked.iter())
            .map(|(input, parked)| if *parked { None } else { input.timestamp() })
            .collect();
        match self.mode {
            BuildMode::Timestamp => self.claim_coincidences(&times),
            BuildMode::Parallel => {
                for (i, input) in self.inputs.iter().enumerate() {
                    self.in_event[i] = !self.parked[i] && input.global_idx().is_some();
                }
                self.event_time = times.iter().flatten().min().copied();
                self.event_time_max = times.iter().flatten().max().copied();
            }
        }

        if !self.in_event.iter().any(|claimed| *claimed) {
            self.current_idx = None;
            log::debug!("EventBuilder reached the end of every input");
            return Ok(false);
        }
        self.consumed.copy_from_slice(&self.in_event);
        self.current_idx = Some(self.next_idx);
        self.next_idx += 1;
        self.publish()?;
        Ok(true)
    }

    fn claim_coincidences(&mut self, times: &[Option<u64>]) {
        let event_time = match times.iter().flatten().min() {
            Some(t) => *t,
            None => return,
        };
        let mut max_time = event_time.saturating_add(self.window);
        loop {
            let mut claimed = false;
            for (i, time) in times.iter().enumerate() {
                match time {
                    Some(t) if !self.in_event[i] && *t <= max_time => {
                        self.in_event[i] = true;
                        max_time = max_time.max(t.saturating_add(self.window));
                        claimed = true;
                    }
                    _ => (),
                }
            }
            if !claimed {
                break;
            }
        }
        self.event_time = Some(event_time);
        self.event_time_max = Some(max_time);
    }

    fn publish(&mut self) -> Result<(), EventBuilderError> {
        if let Some(idx) = self.current_idx {
            self.store.put(&format!("{EVENT_PREFIX}index"), idx.into())?;
        }
        if let Some(time) = self.event_time {
            self.store.put(&format!("{EVENT_PREFIX}time"), time.into())?;
        }
        if let Some(time) = self.event_time_max {
            self.store.put(&format!("{EVENT_PREFIX}time_max"), time.into())?;
        }
        let groups: Vec<String> = self.groups_in_event().into_iter().map(String::from).collect();
        self.store
            .put(&format!("{EVENT_PREFIX}groups"), Value::Names(groups))?;
        for (i, input) in self.inputs.iter().enumerate() {
            if !self.in_event[i] {
                continue;
            }
            if let Some(time) = input.timestamp() {
                self.store.put(
                    &format!("{EVENT_PREFIX}{}:time", input.name()),
                    time.into(),
                )?;
            }
            if let Some(idx) = input.global_idx() {
                self.store
                    .put(&format!("{EVENT_PREFIX}{}:index", input.name()), idx.into())?;
            }
        }
        Ok(())
    }

    /// Call `get_event` up to `n` times. Returns how many events were actually built.
    pub fn skip_events(&mut self, n: usize) -> Result<usize, EventBuilderError> {
        let mut built = 0;
        while built < n && self.get_event()? {
            built += 1;
        }
        Ok(built)
    }

    /// Position the builder at global event `idx`.
    ///
    /// Parallel mode seeks every input directly; inputs with fewer than `idx + 1` events
    /// sit the event out. Timestamp mode can only move forward, by building the intermediate
    /// events.
    pub fn set_idx(&mut self, idx: usize) -> Result<bool, EventBuilderError> {
        match self.mode {
            BuildMode::Parallel => {
                for (input, parked) in self.inputs.iter_mut().zip(self.parked.iter_mut()) {
                    *parked = input.set_idx(idx)?.is_none();
                }
                self.next_idx = idx;
                self.consumed.fill(false);
                self.assemble()
            }
            BuildMode::Timestamp => {
                if let Some(current) = self.current_idx {
                    if idx < current {
                        return Err(EventBuilderError::BackwardSeek {
                            current,
                            requested: idx,
                        });
                    }
                    if idx == current {
                        return Ok(true);
                    }
                }
                if idx < self.next_idx {
                    return Err(EventBuilderError::BackwardSeek {
                        current: self.next_idx,
                        requested: idx,
                    });
                }
                let needed = idx + 1 - self.next_idx;
                let built = self.skip_events(needed)?;
                Ok(built == needed)
            }
        }
    }

    /// Look up a key, decoding it from the owning input on a miss.
    ///
    /// Keys take the form `EVENT:<group>:<field>` or `INPUT:<group>:<field>`. Per-event
    /// fields are only available for inputs taking part in the current event.
    pub fn read(&mut self, key: &str) -> Result<Option<&Value>, EventBuilderError> {
        if self.store.contains(key) {
            return Ok(self.store.get(key));
        }
        let (prefix, rest) = if let Some(rest) = key.strip_prefix(EVENT_PREFIX) {
            (EVENT_PREFIX, rest)
        } else if let Some(rest) = key.strip_prefix(INPUT_PREFIX) {
            (INPUT_PREFIX, rest)
        } else {
            return Ok(None);
        };
        let (group, field) = match rest.split_once(':') {
            Some(split) => split,
            None => return Ok(None),
        };
        let i = match self.inputs.iter().position(|input| input.name() == group) {
            Some(i) => i,
            None => return Ok(None),
        };
        if prefix == EVENT_PREFIX && !self.in_event[i] {
            return Ok(None);
        }
        let value = match self.inputs[i].read(&format!("{prefix}{field}"))? {
            Some(value) => value,
            None => return Ok(None),
        };
        if prefix == EVENT_PREFIX {
            self.store.put(key, value)?;
        } else {
            self.store.save(key, value);
        }
        Ok(self.store.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory source: one sub-event per timestamp
    #[derive(Debug)]
    struct MockSource {
        name: String,
        times: Vec<u64>,
        idx: Option<usize>,
    }

    impl MockSource {
        fn boxed(name: &str, times: &[u64]) -> Box<dyn EventSource> {
            Box::new(Self {
                name: name.to_string(),
                times: times.to_vec(),
                idx: if times.is_empty() { None } else { Some(0) },
            })
        }
    }

    impl EventSource for MockSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn timestamp(&self) -> Option<u64> {
            self.idx.map(|i| self.times[i])
        }

        fn global_idx(&self) -> Option<usize> {
            self.idx
        }

        fn file_index(&self) -> usize {
            0
        }

        fn set_next_event(&mut self) -> Result<Option<usize>, GroupError> {
            self.idx = self.idx.map(|i| i + 1).filter(|i| *i < self.times.len());
            Ok(self.idx)
        }

        fn set_idx(&mut self, idx: usize) -> Result<Option<usize>, GroupError> {
            // Like a group, a seek past the end leaves the position alone
            if idx >= self.times.len() {
                return Ok(None);
            }
            self.idx = Some(idx);
            Ok(self.idx)
        }

        fn read(&mut self, path: &str) -> Result<Option<Value>, GroupError> {
            match path {
                "EVENT:value" => Ok(self.timestamp().map(|t| Value::Int(t as i64 * 2))),
                "INPUT:n_events" => Ok(Some(self.times.len().into())),
                _ => Ok(None),
            }
        }

        fn header(&mut self) -> Result<Vec<(String, Value)>, GroupError> {
            Ok(vec![(String::from("n_events"), self.times.len().into())])
        }

        fn field_names(&self) -> Vec<String> {
            vec![String::from("value")]
        }

        fn total_events(&mut self) -> Result<usize, GroupError> {
            Ok(self.times.len())
        }
    }

    fn collect_events(builder: &mut EventBuilder) -> Vec<Vec<String>> {
        let mut events = Vec::new();
        while builder.get_event().unwrap() {
            events.push(
                builder
                    .groups_in_event()
                    .into_iter()
                    .map(String::from)
                    .collect(),
            );
        }
        events
    }

    #[test]
    fn test_window_merge() {
        let inputs = vec![
            MockSource::boxed("a", &[10, 50]),
            MockSource::boxed("b", &[11]),
        ];
        let mut builder = EventBuilder::new(inputs, BuildMode::Timestamp, 5).unwrap();

        assert!(builder.get_event().unwrap());
        assert_eq!(builder.groups_in_event(), vec!["a", "b"]);
        assert_eq!(builder.event_time(), Some(10));
        assert_eq!(builder.event_time_max(), Some(16));
        assert_eq!(
            builder.read("EVENT:b:time").unwrap(),
            Some(&Value::Int(11))
        );

        assert!(builder.get_event().unwrap());
        assert_eq!(builder.groups_in_event(), vec!["a"]);
        assert_eq!(builder.read("EVENT:time").unwrap(), Some(&Value::Int(50)));
        assert_eq!(builder.read("EVENT:b:time").unwrap(), None);

        assert!(!builder.get_event().unwrap());
        assert_eq!(builder.current_idx(), None);
    }

    #[test]
    fn test_window_merge_three_inputs() {
        let inputs = vec![
            MockSource::boxed("a", &[10]),
            MockSource::boxed("b", &[11]),
            MockSource::boxed("c", &[50]),
        ];
        let mut builder = EventBuilder::new(inputs, BuildMode::Timestamp, 5).unwrap();

        assert!(builder.get_event().unwrap());
        assert_eq!(builder.groups_in_event(), vec!["a", "b"]);
        assert_eq!(builder.event_time(), Some(10));
        assert_eq!(builder.event_time_max(), Some(16));

        assert!(builder.get_event().unwrap());
        assert_eq!(builder.groups_in_event(), vec!["c"]);
        assert_eq!(builder.event_time(), Some(50));
        assert_eq!(builder.event_time_max(), Some(55));

        assert!(!builder.get_event().unwrap());
    }

    #[test]
    fn test_window_chains_through_late_inputs() {
        // 18 is outside 10 + 5 but within 14 + 5 once c is claimed
        let inputs = vec![
            MockSource::boxed("a", &[10]),
            MockSource::boxed("b", &[18]),
            MockSource::boxed("c", &[14]),
        ];
        let mut builder = EventBuilder::new(inputs, BuildMode::Timestamp, 5).unwrap();
        let events = collect_events(&mut builder);
        assert_eq!(events, vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_one_sub_event_per_input() {
        let inputs = vec![MockSource::boxed("a", &[10, 11, 12])];
        let mut builder = EventBuilder::new(inputs, BuildMode::Timestamp, 100).unwrap();
        assert_eq!(collect_events(&mut builder).len(), 3);
    }

    #[test]
    fn test_lazy_read_and_headers() {
        let inputs = vec![MockSource::boxed("a", &[7, 9])];
        let mut builder = EventBuilder::new(inputs, BuildMode::Timestamp, 0).unwrap();
        assert_eq!(
            builder.store().get(GROUPS_KEY),
            Some(&Value::Names(vec![String::from("a")]))
        );
        assert_eq!(
            builder.store().get("INPUT:a:n_events"),
            Some(&Value::Int(2))
        );

        builder.get_event().unwrap();
        assert!(!builder.store().contains("EVENT:a:value"));
        assert_eq!(
            builder.read("EVENT:a:value").unwrap(),
            Some(&Value::Int(14))
        );
        assert!(builder.store().contains("EVENT:a:value"));
        assert_eq!(builder.read("EVENT:a:missing").unwrap(), None);
        assert_eq!(builder.read("EVENT:nobody:value").unwrap(), None);
        assert_eq!(builder.event_keys(), vec![String::from("EVENT:a:value")]);

        builder.get_event().unwrap();
        assert!(!builder.store().contains("EVENT:a:value"));
        assert_eq!(
            builder.read("EVENT:a:value").unwrap(),
            Some(&Value::Int(18))
        );
        assert!(builder.store().contains("INPUT:a:n_events"));
    }

    #[test]
    fn test_skip_and_seek_timestamp_mode() {
        let inputs = vec![MockSource::boxed("a", &[1, 2, 3, 4, 5])];
        let mut builder = EventBuilder::new(inputs, BuildMode::Timestamp, 0).unwrap();
        assert_eq!(builder.skip_events(2).unwrap(), 2);
        assert_eq!(builder.current_idx(), Some(1));

        assert!(builder.set_idx(3).unwrap());
        assert_eq!(builder.event_time(), Some(4));
        assert!(builder.set_idx(3).unwrap());
        assert!(matches!(
            builder.set_idx(0),
            Err(EventBuilderError::BackwardSeek {
                current: 3,
                requested: 0
            })
        ));
        assert_eq!(builder.skip_events(10).unwrap(), 1);
        assert!(!builder.set_idx(9).unwrap());
    }

    #[test]
    fn test_parallel_mode() {
        let inputs = vec![
            MockSource::boxed("a", &[100, 200, 300]),
            MockSource::boxed("b", &[5, 6]),
        ];
        let mut builder = EventBuilder::new(inputs, BuildMode::Parallel, 0).unwrap();
        let events = collect_events(&mut builder);
        assert_eq!(events, vec![vec!["a", "b"], vec!["a", "b"], vec!["a"]]);

        assert!(builder.set_idx(1).unwrap());
        assert_eq!(builder.current_idx(), Some(1));
        assert_eq!(builder.read("EVENT:a:index").unwrap(), Some(&Value::Int(1)));
        assert_eq!(builder.read("EVENT:b:time").unwrap(), Some(&Value::Int(6)));
        assert!(builder.set_idx(0).unwrap());
        assert!(!builder.set_idx(3).unwrap());
    }

    #[test]
    fn test_parallel_seek_past_shorter_input() {
        let inputs = vec![
            MockSource::boxed("a", &[100, 200, 300]),
            MockSource::boxed("b", &[5, 6]),
        ];
        let mut builder = EventBuilder::new(inputs, BuildMode::Parallel, 0).unwrap();
        assert!(builder.set_idx(2).unwrap());
        assert_eq!(builder.groups_in_event(), vec!["a"]);
        assert_eq!(builder.event_time(), Some(300));
        assert_eq!(builder.read("EVENT:b:index").unwrap(), None);
        assert_eq!(builder.read("EVENT:b:value").unwrap(), None);

        // b stays out while the remaining events are pulled
        assert!(!builder.get_event().unwrap());

        assert!(!builder.set_idx(7).unwrap());
        assert_eq!(builder.current_idx(), None);

        assert!(builder.set_idx(1).unwrap());
        assert_eq!(builder.groups_in_event(), vec!["a", "b"]);
        assert_eq!(builder.read("EVENT:b:index").unwrap(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_parallel_seek_with_file_groups() {
        use crate::bluetongue::tests::{bluetongue_file_with_times, BoardLayout};
        use crate::format::DecoderSpec;
        use crate::group::{GroupedInput, StreamSource};
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let mut inputs: Vec<Box<dyn EventSource>> = Vec::new();
        for (name, times) in [("a", &[100u32, 200, 300][..]), ("b", &[5u32, 6][..])] {
            let path = dir.path().join(format!("{name}.bt"));
            let boards = vec![BoardLayout::new(name, "CAEN1730", 2, &[0])];
            std::fs::write(&path, bluetongue_file_with_times(&boards, times)).unwrap();
            let sources = vec![StreamSource {
                label: None,
                files: vec![path],
            }];
            inputs.push(Box::new(
                GroupedInput::new(name, sources, DecoderSpec::default(), 1).unwrap(),
            ));
        }
        let mut builder = EventBuilder::new(inputs, BuildMode::Parallel, 0).unwrap();

        assert!(builder.set_idx(2).unwrap());
        assert_eq!(builder.groups_in_event(), vec!["a"]);
        assert_eq!(builder.read("EVENT:a:index").unwrap(), Some(&Value::Int(2)));
        assert_eq!(builder.read("EVENT:b:index").unwrap(), None);
        assert_eq!(builder.read("EVENT:b:timestamp").unwrap(), None);

        assert!(!builder.set_idx(7).unwrap());
        assert_eq!(builder.current_idx(), None);
        assert!(builder.groups_in_event().is_empty());

        assert!(builder.set_idx(1).unwrap());
        assert_eq!(builder.groups_in_event(), vec!["a", "b"]);
        assert_eq!(builder.read("EVENT:b:index").unwrap(), Some(&Value::Int(1)));
        assert_eq!(builder.read("EVENT:b:time").unwrap(), Some(&Value::Int(6)));
        assert_eq!(
            builder.read("EVENT:b:timestamp").unwrap(),
            Some(&Value::Int(6))
        );
    }

    #[test]
    fn test_group_time_does_not_shadow_decoder_timestamp() {
        use crate::bluetongue::tests::{bluetongue_file_with_times, BoardLayout};
        use crate::format::DecoderSpec;
        use crate::group::{GroupedInput, StreamSource};
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scaled.bt");
        let boards = vec![BoardLayout::new("scaled", "CAEN1730", 2, &[0])];
        std::fs::write(&path, bluetongue_file_with_times(&boards, &[7])).unwrap();
        let sources = vec![StreamSource {
            label: None,
            files: vec![path],
        }];
        let inputs: Vec<Box<dyn EventSource>> = vec![Box::new(
            GroupedInput::new("s", sources, DecoderSpec::default(), 4).unwrap(),
        )];
        let mut builder = EventBuilder::new(inputs, BuildMode::Timestamp, 0).unwrap();

        assert!(builder.get_event().unwrap());
        assert_eq!(builder.read("EVENT:s:time").unwrap(), Some(&Value::Int(28)));
        assert_eq!(builder.read("EVENT:s:timestamp").unwrap(), Some(&Value::Int(7)));
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            EventBuilder::new(Vec::new(), BuildMode::Timestamp, 0),
            Err(EventBuilderError::NoInputs)
        ));
        let inputs = vec![MockSource::boxed("a", &[1]), MockSource::boxed("a", &[2])];
        assert!(matches!(
            EventBuilder::new(inputs, BuildMode::Timestamp, 0),
            Err(EventBuilderError::DuplicateInput(_))
        ));
    }
}
