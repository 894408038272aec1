// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shell scripts standing in for GN, autoninja, the capture binary and the replay binary.

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use indoc::{formatdoc, indoc};
use std::os::unix::fs::PermissionsExt;

/// Every test the fake capture binary lists.
pub const LISTED_TESTS: &[&str] = &[
    "Suite.A",
    "Suite.B",
    "Suite.Mismatch",
    "Suite.NoResult",
    "Suite.Skipped",
    "Suite.NoTrace",
    "Suite.Excluded",
];

/// Lists the tests above. In capture mode, writes a complete trace for every test in the filter
/// except `Suite.Skipped` (reported as skipped) and `Suite.NoTrace` (no manifest).
const CAPTURE: &str = indoc! {r#"
    if [ "$1" = "--list-tests" ]; then
        echo "Tests list:"
        for name in Suite.A Suite.B Suite.Mismatch Suite.NoResult Suite.Skipped Suite.NoTrace Suite.Excluded; do
            echo "$name"
        done
        echo "End tests list."
        exit 0
    fi

    filter="${1#--gtest_filter=}"
    results="${3#--results-file=}"
    entries=""
    for name in $(echo "$filter" | tr ':' ' '); do
        label=$(printf '%s' "$name" | tr './' '__')
        actual=PASS
        if [ "$name" = Suite.Skipped ]; then
            actual=SKIP
        else
            for f in _context1.h _context1.cpp _context1_001.cpp; do
                : > "$ANGLE_CAPTURE_OUT_DIR/$label$f"
            done
            if [ "$name" != Suite.NoTrace ]; then
                : > "$ANGLE_CAPTURE_OUT_DIR/$label.json"
            fi
        fi
        entries="$entries${entries:+,}\"$name\": {\"actual\": \"$actual\"}"
    done
    echo "{\"tests\": {$entries}}" > "$results"
"#};

/// Replays a label. `Suite_Mismatch` reports a state mismatch and leaves snapshots behind,
/// `Suite_NoResult` reports nothing.
const REPLAY: &str = indoc! {r#"
    case "$1" in
        Suite_Mismatch)
            printf 'frame 1\nred 1\n' > "$1_ContextCaptured1.json"
            printf 'frame 1\nred 0\n' > "$1_ContextReplayed1.json"
            echo "*RESULT $1 -2"
            ;;
        Suite_NoResult)
            echo "replay started"
            ;;
        *)
            echo "*RESULT $1 0"
            ;;
    esac
"#};

/// `gn gen <dir> --args=...`
const GN: &str = indoc! {r#"
    mkdir -p "$2"
"#};

/// `autoninja -C <dir> <target>`: "builds" a target by copying the script of the same name.
const NINJA: &str = indoc! {r#"
    cp "$(dirname "$0")/$3" "$2/$3"
"#};

/// A checkout with the fake tools and a config pointing at them.
pub struct FakeCheckout {
    root: Utf8TempDir,
}

impl FakeCheckout {
    pub fn new() -> Self {
        let root = camino_tempfile::Builder::new()
            .prefix("capture-replay-integration-")
            .tempdir()
            .expect("tempdir created");
        let tools = root.path().join("tools");
        std::fs::create_dir_all(&tools).expect("tools dir created");

        write_script(&tools, "angle_end2end_tests", CAPTURE);
        write_script(&tools, "capture_replay_tests", REPLAY);
        let gn = write_script(&tools, "gn", GN);
        let ninja = write_script(&tools, "ninja", NINJA);

        let config_dir = root.path().join(".config");
        std::fs::create_dir_all(&config_dir).expect("config dir created");
        std::fs::write(
            config_dir.join("capture-replay.toml"),
            formatdoc! {r#"
                    gn-command = "{gn}"
                    ninja-command = "{ninja}"
                    temp-dir = "out/traces"
                    batch-count = 2
                    max-jobs = 2
                    expectations-file = "expectations.txt"
                "#},
        )
        .expect("config written");

        std::fs::write(
            root.path().join("expectations.txt"),
            indoc! {"
                # Known issues.
                1234 : Suite.Excluded = SKIP_FOR_CAPTURE
                : Suite.Mismatch = FAIL
            "},
        )
        .expect("expectations written");

        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        self.root.path()
    }
}

fn write_script(dir: &Utf8Path, name: &str, body: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("script written");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("permissions set");
    path
}
