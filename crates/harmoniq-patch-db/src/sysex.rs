//! Helpers for raw system exclusive dumps.

use crate::types::{SYSEX_END, SYSEX_START};

/// Splits a raw dump into individual `F0 .. F7` messages.
///
/// Bytes outside of a message are ignored. A message interrupted by a new
/// start byte is discarded.
pub fn split_sysex(data: &[u8]) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut current: Option<Vec<u8>> = None;

    for &byte in data {
        if byte == SYSEX_START {
            current = Some(vec![byte]);
            continue;
        }
        let Some(message) = current.as_mut() else {
            continue;
        };
        message.push(byte);
        if byte == SYSEX_END {
            if let Some(done) = current.take() {
                messages.push(done);
            }
        }
    }

    messages
}

/// Concatenates payloads into a single dump.
pub fn join_sysex<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in payloads {
        out.extend_from_slice(payload);
    }
    out
}

/// Maps every character outside `[0-9A-Za-z]` to `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
