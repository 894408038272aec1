// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The configuration a run is gated on: host platform, build type and sanitizers.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Tags describing the configuration of a run.
    ///
    /// Expectation lines apply only if every one of their tags is present in the run's
    /// `ConfigTags`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct ConfigTags: u16 {
        /// Windows host.
        const WIN = 1 << 0;
        /// macOS host.
        const MAC = 1 << 1;
        /// Linux host.
        const LINUX = 1 << 2;
        /// Android target.
        const ANDROID = 1 << 3;
        /// Debug build.
        const DEBUG = 1 << 4;
        /// Release build.
        const RELEASE = 1 << 5;
        /// AddressSanitizer build.
        const ASAN = 1 << 6;
        /// NVIDIA GPU.
        const NVIDIA = 1 << 7;
        /// AMD GPU.
        const AMD = 1 << 8;
        /// Intel GPU.
        const INTEL = 1 << 9;
    }
}

impl ConfigTags {
    /// Tag names as they appear in expectations files.
    const NAMES: &'static [(&'static str, ConfigTags)] = &[
        ("WIN", ConfigTags::WIN),
        ("MAC", ConfigTags::MAC),
        ("LINUX", ConfigTags::LINUX),
        ("ANDROID", ConfigTags::ANDROID),
        ("DEBUG", ConfigTags::DEBUG),
        ("RELEASE", ConfigTags::RELEASE),
        ("ASAN", ConfigTags::ASAN),
        ("NVIDIA", ConfigTags::NVIDIA),
        ("AMD", ConfigTags::AMD),
        ("INTEL", ConfigTags::INTEL),
    ];

    /// Returns the tags for the current host and the given build settings.
    pub fn current(debug: bool, asan: bool) -> Self {
        let mut tags = Self::host_platform();
        tags |= if debug { Self::DEBUG } else { Self::RELEASE };
        if asan {
            tags |= Self::ASAN;
        }
        tags
    }

    /// Returns the tag for the host platform, or an empty set on unrecognized platforms.
    pub fn host_platform() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                Self::WIN
            } else if #[cfg(target_os = "macos")] {
                Self::MAC
            } else if #[cfg(target_os = "android")] {
                Self::ANDROID
            } else if #[cfg(target_os = "linux")] {
                Self::LINUX
            } else {
                Self::empty()
            }
        }
    }

    /// Looks up a single tag by name. Matching is case-insensitive.
    pub fn from_tag_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(tag_name, _)| tag_name.eq_ignore_ascii_case(name))
            .map(|(_, tag)| *tag)
    }
}

impl fmt::Display for ConfigTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, tag) in Self::NAMES {
            if self.contains(*tag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
