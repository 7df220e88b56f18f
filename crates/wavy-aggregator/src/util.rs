// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions shared by the aggregator components.

/// Maps a device id onto a safe file stem for the per-device durable mirror.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other character is replaced by `_`. A leading
/// `.` can therefore never occur, so the stem cannot escape the mirror directory.
///
/// # Examples
///
/// ```
/// use wavy_aggregator::util::file_stem_for;
///
/// assert_eq!(file_stem_for("WAVY001"), "WAVY001");
/// assert_eq!(file_stem_for("../etc/passwd"), "___etc_passwd");
/// ```
pub fn file_stem_for(device: &str) -> String {
    device
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Parses a comma-separated list, trimming whitespace and dropping empty entries.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
