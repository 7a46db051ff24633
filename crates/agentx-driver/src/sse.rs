// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-sent-event line framing shared by the HTTP drivers.
//!
//! SSE lines can be split across TCP chunks, so a remainder buffer is
//! carried forward; only complete lines (terminated by `\n`) are parsed and
//! anything left over is prepended to the next chunk.

use futures::{Stream, StreamExt};

/// Extract the payload of every complete `data:` line from a byte stream.
/// Transport errors surface as `Err(message)` items so the caller can map
/// them to a terminal `error` event.
pub fn data_lines<B, E>(
    byte_stream: impl Stream<Item = Result<B, E>> + Send,
) -> impl Stream<Item = Result<String, String>> + Send
where
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    byte_stream
        .scan(String::new(), |buf, chunk| {
            let items = match chunk {
                Ok(bytes) => {
                    buf.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                    let mut lines = Vec::new();
                    while let Some(pos) = buf.find('\n') {
                        let line = buf[..pos].trim_end_matches('\r').to_string();
                        buf.drain(..=pos);
                        if let Some(data) = line.strip_prefix("data:") {
                            lines.push(Ok(data.trim().to_string()));
                        }
                    }
                    lines
                }
                Err(e) => vec![Err(e.to_string())],
            };
            futures::future::ready(Some(items))
        })
        .flat_map(futures::stream::iter)
}
