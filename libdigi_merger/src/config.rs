use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::event_builder::BuildMode;
use super::format::{DecoderSpec, Format};
use super::group::StreamSource;
use super::wavedump::TextStructure;

/// One stream of a group. Files are either listed explicitly or discovered in a directory
/// by prefix and suffix, sorted by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

fn default_tick() -> u64 {
    1
}

/// A named input of the merge: one digitizer, or several digitizers read in lockstep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Force a format instead of sniffing each file
    #[serde(default)]
    pub format: Option<Format>,
    pub streams: Vec<StreamConfig>,
    /// Native timestamp unit expressed in the common time base
    #[serde(default = "default_tick")]
    pub tick: u64,
    /// Sub-event merge window for DPP-PSD data, in native units
    #[serde(default)]
    pub coincidence_window: u64,
    /// Label layout override for WaveDump text files
    #[serde(default)]
    pub structure: Option<TextStructure>,
}

/// Structure representing the application configuration.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub mode: BuildMode,
    /// Coincidence window of the event builder, in the common time base
    #[serde(default)]
    pub window: u64,
    #[serde(default)]
    pub first_event: usize,
    #[serde(default)]
    pub max_events: Option<usize>,
    /// Store keys read for every event, e.g. `EVENT:top:board_0:raw_waveform_ch_3`
    #[serde(default)]
    pub keys: Vec<String>,
}

impl Default for Config {
    /// Generate a template Config. The paths are placeholders
    fn default() -> Self {
        Self {
            groups: vec![GroupConfig {
                name: String::from("digitizer"),
                format: None,
                streams: vec![StreamConfig {
                    label: None,
                    files: Vec::new(),
                    directory: Some(PathBuf::from("None")),
                    prefix: String::from("run_"),
                    suffix: String::from(".dat"),
                }],
                tick: 1,
                coincidence_window: 0,
                structure: None,
            }],
            mode: BuildMode::Timestamp,
            window: 100,
            first_event: 0,
            max_events: None,
            keys: vec![String::from("EVENT:time"), String::from("EVENT:groups")],
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check that every group is named uniquely and that every stream resolves to files
    /// which exist
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::MissingParameter(String::from("groups")));
        }
        for (idx, group) in self.groups.iter().enumerate() {
            if group.name.is_empty() {
                return Err(ConfigError::MissingParameter(format!("name of group {idx}")));
            }
            if self.groups[..idx].iter().any(|g| g.name == group.name) {
                return Err(ConfigError::DuplicateGroup(group.name.clone()));
            }
            if group.streams.is_empty() {
                return Err(ConfigError::MissingParameter(format!(
                    "streams of group {}",
                    group.name
                )));
            }
            for stream in group.streams.iter() {
                for file in self.stream_files(group, stream)? {
                    if !file.is_file() {
                        return Err(ConfigError::BadFilePath(file));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve the ordered file chain of a stream
    pub fn stream_files(
        &self,
        group: &GroupConfig,
        stream: &StreamConfig,
    ) -> Result<Vec<PathBuf>, ConfigError> {
        match (&stream.directory, stream.files.is_empty()) {
            (Some(_), false) => Err(ConfigError::AmbiguousStream(group.name.clone())),
            (None, false) => Ok(stream.files.clone()),
            (None, true) => Err(ConfigError::MissingParameter(format!(
                "files or directory of a stream in group {}",
                group.name
            ))),
            (Some(dir), true) => {
                if !dir.is_dir() {
                    return Err(ConfigError::BadFilePath(dir.clone()));
                }
                let mut files: Vec<PathBuf> = Vec::new();
                for entry in dir.read_dir()? {
                    let path = entry?.path();
                    let name = match path.file_name() {
                        Some(n) => n.to_string_lossy().to_string(),
                        None => continue,
                    };
                    if path.is_file()
                        && name.starts_with(&stream.prefix)
                        && name.ends_with(&stream.suffix)
                    {
                        files.push(path);
                    }
                }
                files.sort();
                if files.is_empty() {
                    return Err(ConfigError::MissingParameter(format!(
                        "files matching {}*{} in {}",
                        stream.prefix,
                        stream.suffix,
                        dir.to_string_lossy()
                    )));
                }
                Ok(files)
            }
        }
    }

    /// The streams of a group in the form the group reader takes
    pub fn group_sources(&self, group: &GroupConfig) -> Result<Vec<StreamSource>, ConfigError> {
        let mut sources = Vec::with_capacity(group.streams.len());
        for stream in group.streams.iter() {
            sources.push(StreamSource {
                label: stream.label.clone(),
                files: self.stream_files(group, stream)?,
            });
        }
        Ok(sources)
    }

    pub fn decoder_spec(&self, group: &GroupConfig) -> DecoderSpec {
        DecoderSpec {
            format: group.format,
            structure: group.structure.clone(),
            coincidence_window: group.coincidence_window,
        }
    }

    /// Total size in bytes of every input file
    pub fn total_data_size(&self) -> Result<u64, ConfigError> {
        let mut total = 0;
        for group in self.groups.iter() {
            for stream in group.streams.iter() {
                for file in self.stream_files(group, stream)? {
                    total += file.metadata()?.len();
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"1234").unwrap();
        path
    }

    fn directory_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.groups[0].streams[0].directory = Some(dir.path().to_path_buf());
        config
    }

    #[test]
    fn test_directory_discovery_sorted() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "run_2.dat");
        touch(&dir, "run_0.dat");
        touch(&dir, "run_1.dat");
        touch(&dir, "run_1.log");
        touch(&dir, "other_0.dat");
        let config = directory_config(&dir);
        let group = &config.groups[0];
        let files = config.stream_files(group, &group.streams[0]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["run_0.dat", "run_1.dat", "run_2.dat"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.total_data_size().unwrap(), 12);
    }

    #[test]
    fn test_validation_errors() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "run_0.dat");

        let mut config = directory_config(&dir);
        config.groups.push(config.groups[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateGroup(_))
        ));

        let mut config = directory_config(&dir);
        config.groups[0].streams[0].files = vec![dir.path().join("run_0.dat")];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AmbiguousStream(_))
        ));

        let mut config = directory_config(&dir);
        config.groups[0].streams[0].directory = None;
        config.groups[0].streams[0].files = vec![dir.path().join("missing.dat")];
        assert!(matches!(config.validate(), Err(ConfigError::BadFilePath(_))));

        let mut config = directory_config(&dir);
        config.groups.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip_and_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        let config = Config::default();
        config.write_config_file(&path).unwrap();
        let read = Config::read_config_file(&path).unwrap();
        assert_eq!(read.groups[0].name, "digitizer");
        assert_eq!(read.window, 100);

        let yaml = r#"
groups:
  - name: psd
    format: caen_psd
    coincidence_window: 40
    streams:
      - files: [a.dat, b.dat]
mode: parallel
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let group = &config.groups[0];
        assert_eq!(group.format, Some(Format::CaenPsd));
        assert_eq!(group.tick, 1);
        assert_eq!(config.mode, BuildMode::Parallel);
        assert_eq!(config.decoder_spec(group).coincidence_window, 40);
        assert_eq!(config.group_sources(group).unwrap()[0].files.len(), 2);
        assert!(config.max_events.is_none());
    }
}
