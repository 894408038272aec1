// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for capture-replay runs.
//!
//! Configuration is layered: the embedded default config, then the user's config file, then
//! command-line overrides.

use crate::{errors::ConfigParseError, platform::ConfigTags};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigError, File, FileFormat};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{collections::BTreeSet, fmt, num::NonZeroUsize, time::Duration};

/// Overall configuration for capture-replay.
///
/// This is the root data structure for capture-replay configuration. Most runs will use
/// [`CaptureReplayConfig::from_sources`] to read it, followed by
/// [`apply_overrides`](Self::apply_overrides) with command-line values, and finally
/// [`resolve`](Self::resolve) to obtain absolute paths.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaptureReplayConfig {
    build_dir: Utf8PathBuf,
    test_suite: String,
    replay_target: String,
    #[serde(default)]
    temp_dir: Option<Utf8PathBuf>,
    batch_count: NonZeroUsize,
    max_jobs: NonZeroUsize,
    max_ninja_jobs: NonZeroUsize,
    #[serde(default)]
    expectations_file: Option<Utf8PathBuf>,
    gn_command: String,
    ninja_command: String,
    debug: bool,
    asan: bool,
    keep_temp_files: bool,
    purge: bool,
    timeouts: TimeoutConfig,
    capture: CaptureConfig,
    #[serde(default)]
    gn_args: IndexMap<String, GnArgValue>,
}

impl CaptureReplayConfig {
    /// The default location of the config file, relative to the root directory.
    pub const CONFIG_PATH: &'static str = ".config/capture-replay.toml";

    /// Contains the default config as a TOML file.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// Reads the config from the default config, then `config_file` (or
    /// `<root>/.config/capture-replay.toml` if it exists).
    ///
    /// `unknown_callback` is called with the set of keys that were not recognized.
    pub fn from_sources(
        root: &Utf8Path,
        config_file: Option<&Utf8Path>,
        mut unknown_callback: impl FnMut(&Utf8Path, &BTreeSet<String>),
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let config = Config::builder()
            .add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(source)
            .build()
            .map_err(|err| ConfigParseError::new(&config_file, err))?;

        let mut unknown = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            unknown.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config =
            Self::deserialize(ignored_de).map_err(|err| ConfigParseError::new(&config_file, err))?;
        config
            .capture
            .validate()
            .map_err(|err| ConfigParseError::new(&config_file, err))?;

        if !unknown.is_empty() {
            unknown_callback(&config_file, &unknown);
        }

        Ok(config)
    }

    /// Returns the default config, without reading any files.
    pub fn default_config() -> Self {
        let config = Config::builder()
            .add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
            .build()
            .expect("default config is always valid");
        Self::deserialize(config).expect("default config is always valid")
    }

    /// Applies command-line overrides on top of the config.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            build_dir,
            test_suite,
            temp_dir,
            batch_count,
            max_jobs,
            max_ninja_jobs,
            expectations_file,
            mid_execution_capture,
            debug,
            asan,
            keep_temp_files,
            purge,
        } = overrides;

        if let Some(build_dir) = build_dir {
            self.build_dir = build_dir;
        }
        if let Some(test_suite) = test_suite {
            self.test_suite = test_suite;
        }
        if let Some(temp_dir) = temp_dir {
            self.temp_dir = Some(temp_dir);
        }
        if let Some(batch_count) = batch_count {
            self.batch_count = batch_count;
        }
        if let Some(max_jobs) = max_jobs {
            self.max_jobs = max_jobs;
        }
        if let Some(max_ninja_jobs) = max_ninja_jobs {
            self.max_ninja_jobs = max_ninja_jobs;
        }
        if let Some(expectations_file) = expectations_file {
            self.expectations_file = Some(expectations_file);
        }
        if let Some(mec) = mid_execution_capture {
            self.capture.mid_execution_capture = mec;
        }
        // Flags can only turn these on.
        self.debug |= debug;
        self.asan |= asan;
        self.keep_temp_files |= keep_temp_files;
        self.purge |= purge;
    }

    /// Returns the number of tests per batch.
    pub fn batch_count(&self) -> NonZeroUsize {
        self.batch_count
    }

    /// Returns the tags that select which expectation lines apply.
    pub fn config_tags(&self) -> ConfigTags {
        ConfigTags::current(self.debug, self.asan)
    }

    /// Returns the expectations file, relative to the root directory, if configured.
    pub fn expectations_file(&self) -> Option<&Utf8Path> {
        self.expectations_file.as_deref()
    }

    /// Resolves relative paths against `root`, producing the settings used by the runner.
    pub fn resolve(&self, root: &Utf8Path) -> RunSettings {
        let build_dir = root.join(&self.build_dir);
        let capture_exe = build_dir.join(format!(
            "{}{}",
            self.test_suite,
            std::env::consts::EXE_SUFFIX
        ));

        let available = std::thread::available_parallelism()
            .unwrap_or(NonZeroUsize::MIN)
            .get();
        let worker_count = self.max_jobs.get().min(available).max(1);

        // Build type arguments come first so user-supplied ones can override them.
        let mut gn_args = vec![
            ("is_debug".to_owned(), GnArgValue::Bool(self.debug)),
            ("is_asan".to_owned(), GnArgValue::Bool(self.asan)),
        ];
        gn_args.extend(
            self.gn_args
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        RunSettings {
            root: root.to_owned(),
            build_dir,
            test_suite: self.test_suite.clone(),
            capture_exe,
            replay_target: self.replay_target.clone(),
            temp_dir: self.temp_dir.as_ref().map(|dir| root.join(dir)),
            worker_count,
            max_ninja_jobs: self.max_ninja_jobs.get(),
            gn_command: self.gn_command.clone(),
            ninja_command: self.ninja_command.clone(),
            keep_temp_files: self.keep_temp_files,
            purge: self.purge,
            timeouts: self.timeouts.clone(),
            capture: self.capture.clone(),
            gn_args,
        }
    }
}

/// Command-line overrides for [`CaptureReplayConfig`].
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Overrides `build-dir`.
    pub build_dir: Option<Utf8PathBuf>,
    /// Overrides `test-suite`.
    pub test_suite: Option<String>,
    /// Overrides `temp-dir`.
    pub temp_dir: Option<Utf8PathBuf>,
    /// Overrides `batch-count`.
    pub batch_count: Option<NonZeroUsize>,
    /// Overrides `max-jobs`.
    pub max_jobs: Option<NonZeroUsize>,
    /// Overrides `max-ninja-jobs`.
    pub max_ninja_jobs: Option<NonZeroUsize>,
    /// Overrides `expectations-file`.
    pub expectations_file: Option<Utf8PathBuf>,
    /// Overrides `capture.mid-execution-capture`.
    pub mid_execution_capture: Option<u32>,
    /// Turns on `debug`.
    pub debug: bool,
    /// Turns on `asan`.
    pub asan: bool,
    /// Turns on `keep-temp-files`.
    pub keep_temp_files: bool,
    /// Turns on `purge`.
    pub purge: bool,
}

/// Timeouts for each kind of subprocess.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TimeoutConfig {
    /// Timeout for listing tests.
    #[serde(with = "humantime_serde")]
    pub list_tests: Duration,
    /// Timeout for capturing one batch.
    #[serde(with = "humantime_serde")]
    pub capture: Duration,
    /// Timeout for each build invocation.
    #[serde(with = "humantime_serde")]
    pub build: Duration,
    /// Timeout for replaying one test.
    #[serde(with = "humantime_serde")]
    pub replay: Duration,
}

/// Settings for the capture phase.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CaptureConfig {
    frame_end: u32,
    mid_execution_capture: u32,
    serialize_state: bool,
    #[serde(default)]
    features_enabled: Vec<String>,
    #[serde(default)]
    features_disabled: Vec<String>,
    #[serde(default)]
    extra_args: Vec<String>,
}

impl CaptureConfig {
    /// The largest accepted `mid-execution-capture` frame. The capture ends one frame later.
    pub const MAX_MID_EXECUTION_CAPTURE: u32 = u32::MAX - 1;

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mid_execution_capture > Self::MAX_MID_EXECUTION_CAPTURE {
            return Err(ConfigError::Message(format!(
                "capture.mid-execution-capture must be at most {}, found {}",
                Self::MAX_MID_EXECUTION_CAPTURE,
                self.mid_execution_capture,
            )));
        }
        Ok(())
    }

    /// Returns the environment variables that turn on frame capture into `out_dir`.
    pub fn capture_env(&self, out_dir: &Utf8Path) -> Vec<(String, String)> {
        let mut env = vec![
            ("ANGLE_CAPTURE_ENABLED".to_owned(), "1".to_owned()),
            ("ANGLE_CAPTURE_OUT_DIR".to_owned(), out_dir.to_string()),
            (
                "ANGLE_CAPTURE_SERIALIZE_STATE".to_owned(),
                if self.serialize_state { "1" } else { "0" }.to_owned(),
            ),
        ];

        if !self.features_enabled.is_empty() {
            env.push((
                "ANGLE_FEATURE_OVERRIDES_ENABLED".to_owned(),
                self.features_enabled.join(":"),
            ));
        }
        if !self.features_disabled.is_empty() {
            env.push((
                "ANGLE_FEATURE_OVERRIDES_DISABLED".to_owned(),
                self.features_disabled.join(":"),
            ));
        }

        if self.mid_execution_capture > 0 {
            env.push((
                "ANGLE_CAPTURE_FRAME_START".to_owned(),
                self.mid_execution_capture.to_string(),
            ));
            env.push((
                "ANGLE_CAPTURE_FRAME_END".to_owned(),
                self.mid_execution_capture.saturating_add(1).to_string(),
            ));
        } else {
            env.push(("ANGLE_CAPTURE_FRAME_END".to_owned(), self.frame_end.to_string()));
        }

        env
    }

    /// Extra arguments passed to the test suite during capture.
    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }
}

/// A value in the `[gn-args]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum GnArgValue {
    /// A boolean, written as `true` or `false`.
    Bool(bool),
    /// An integer.
    Integer(i64),
    /// A string, written quoted.
    String(String),
}

impl GnArgValue {
    /// Creates a string value.
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }
}

impl fmt::Display for GnArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => {
                write!(f, "\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

/// Settings for a run, with paths resolved against the root directory.
#[derive(Clone, Debug)]
pub struct RunSettings {
    /// The root directory. Subprocesses run here unless stated otherwise.
    pub root: Utf8PathBuf,
    /// The build directory containing the test suite.
    pub build_dir: Utf8PathBuf,
    /// The name of the test suite target.
    pub test_suite: String,
    /// The path to the capture binary.
    pub capture_exe: Utf8PathBuf,
    /// The name of the replay target.
    pub replay_target: String,
    /// The directory for trace files, or `None` to use a fresh temporary directory.
    pub temp_dir: Option<Utf8PathBuf>,
    /// The number of workers.
    pub worker_count: usize,
    /// The maximum number of concurrent build invocations.
    pub max_ninja_jobs: usize,
    /// The GN executable.
    pub gn_command: String,
    /// The ninja-compatible build executable.
    pub ninja_command: String,
    /// Whether to keep trace files after the run.
    pub keep_temp_files: bool,
    /// Whether to delete per-worker replay build directories after the run.
    pub purge: bool,
    /// Timeouts.
    pub timeouts: TimeoutConfig,
    /// Capture settings.
    pub capture: CaptureConfig,
    /// GN arguments common to every build.
    pub gn_args: Vec<(String, GnArgValue)>,
}

impl RunSettings {
    /// Returns the replay build directory for a worker.
    pub fn replay_build_dir(&self, worker_id: usize) -> Utf8PathBuf {
        self.build_dir.join(format!("Replay{worker_id}"))
    }

    /// Returns the path to the replay binary in a replay build directory.
    pub fn replay_exe(&self, replay_build_dir: &Utf8Path) -> Utf8PathBuf {
        replay_build_dir.join(format!(
            "{}{}",
            self.replay_target,
            std::env::consts::EXE_SUFFIX
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        let config = CaptureReplayConfig::default_config();
        assert_eq!(config.batch_count.get(), 8);
        assert_eq!(config.max_ninja_jobs.get(), 3);
        assert_eq!(config.timeouts.capture, Duration::from_secs(600));
        assert_eq!(config.capture.frame_end, 100);
        assert!(config.gn_args.is_empty());
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("capture-replay.toml");
        std::fs::write(
            &config_path,
            indoc! {r#"
                batch-count = 2
                unknown-key = true

                [timeouts]
                replay = "30s"

                [capture]
                features-disabled = ["supportsHostQueryReset", "preferDrawClearOverVkCmdClearAttachments"]

                [gn-args]
                use_remoteexec = true
                symbol_level = 1
                target_os = "linux"
            "#},
        )
        .unwrap();

        let mut unknown_keys = BTreeSet::new();
        let config =
            CaptureReplayConfig::from_sources(dir.path(), Some(&config_path), |_, unknown| {
                unknown_keys.extend(unknown.iter().cloned());
            })
            .expect("config is valid");

        assert_eq!(config.batch_count.get(), 2);
        assert_eq!(config.timeouts.replay, Duration::from_secs(30));
        assert_eq!(
            config.timeouts.capture,
            Duration::from_secs(600),
            "unset keys keep their defaults"
        );
        assert_eq!(
            config.capture.features_disabled,
            vec![
                "supportsHostQueryReset".to_owned(),
                "preferDrawClearOverVkCmdClearAttachments".to_owned(),
            ]
        );
        assert_eq!(
            unknown_keys,
            BTreeSet::from(["unknown-key".to_owned()]),
            "unknown keys are reported"
        );

        let settings = config.resolve(dir.path());
        let gn_args: Vec<_> = settings
            .gn_args
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        assert_eq!(
            gn_args,
            vec![
                "is_debug=false",
                "is_asan=false",
                "use_remoteexec=true",
                "symbol_level=1",
                "target_os=\"linux\"",
            ]
        );
    }

    #[test]
    fn missing_default_config_file_is_fine() {
        let dir = tempdir().unwrap();
        let config = CaptureReplayConfig::from_sources(dir.path(), None, |_, _| {
            panic!("no unknown keys expected")
        })
        .expect("default config is used");
        assert_eq!(config.test_suite, "angle_end2end_tests");
    }

    #[test]
    fn overrides() {
        let mut config = CaptureReplayConfig::default_config();
        config.apply_overrides(ConfigOverrides {
            batch_count: NonZeroUsize::new(1),
            mid_execution_capture: Some(5),
            debug: true,
            ..ConfigOverrides::default()
        });
        assert_eq!(config.batch_count.get(), 1);
        assert!(config.config_tags().contains(ConfigTags::DEBUG));

        let env = config.capture.capture_env(Utf8Path::new("/tmp/traces"));
        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(lookup("ANGLE_CAPTURE_FRAME_START"), Some("5"));
        assert_eq!(lookup("ANGLE_CAPTURE_FRAME_END"), Some("6"));
        assert_eq!(lookup("ANGLE_CAPTURE_OUT_DIR"), Some("/tmp/traces"));
        assert_eq!(
            lookup("ANGLE_FEATURE_OVERRIDES_ENABLED"),
            Some("forceRobustResourceInit:forceInitShaderVariables")
        );
    }

    #[test]
    fn capture_env_without_mec() {
        let config = CaptureReplayConfig::default_config();
        let env = config.capture.capture_env(Utf8Path::new("traces"));
        assert!(env.iter().all(|(k, _)| k != "ANGLE_CAPTURE_FRAME_START"));
        assert!(env.contains(&("ANGLE_CAPTURE_FRAME_END".to_owned(), "100".to_owned())));
        assert!(env.contains(&("ANGLE_CAPTURE_SERIALIZE_STATE".to_owned(), "1".to_owned())));
    }

    #[test]
    fn mid_execution_capture_upper_bound() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("capture-replay.toml");
        std::fs::write(
            &config_path,
            indoc! {"
                [capture]
                mid-execution-capture = 4294967295
            "},
        )
        .unwrap();
        let error = CaptureReplayConfig::from_sources(dir.path(), Some(&config_path), |_, _| {})
            .expect_err("frame past the last one is rejected");
        assert_eq!(error.config_file(), &config_path);
        let source = std::error::Error::source(&error)
            .expect("error has a source")
            .to_string();
        assert!(
            source.contains("mid-execution-capture must be at most 4294967294"),
            "{source}"
        );

        std::fs::write(
            &config_path,
            indoc! {"
                [capture]
                mid-execution-capture = 4294967294
            "},
        )
        .unwrap();
        let config = CaptureReplayConfig::from_sources(dir.path(), Some(&config_path), |_, _| {})
            .expect("largest frame is accepted");
        let env = config.capture.capture_env(Utf8Path::new("traces"));
        assert!(env.contains(&(
            "ANGLE_CAPTURE_FRAME_END".to_owned(),
            "4294967295".to_owned()
        )));
    }

    #[test]
    fn gn_string_escaping() {
        assert_eq!(
            GnArgValue::string(r#"C:\out "x""#).to_string(),
            r#""C:\\out \"x\"""#
        );
    }
}
