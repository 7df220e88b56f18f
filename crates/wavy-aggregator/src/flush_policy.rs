// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Decides whether a device buffer should be flushed after an append.
///
/// `volume` is the device's configured threshold. A missing or zero volume never triggers; such a
/// device only flushes on disconnect or shutdown.
pub fn should_flush(buffered_lines: usize, volume: Option<u32>) -> bool {
    match volume {
        Some(volume) if volume > 0 => buffered_lines >= volume as usize,
        _ => false,
    }
}
