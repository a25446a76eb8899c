//! A device backed by the local machine.
//!
//! Only processes spawned through this device are gated; spawns made by
//! anything else on the host are never observed. Scripts are shell programs
//! that run alongside their process and talk back over stdout/stderr.

mod device;
mod script;

pub use device::LocalDevice;
pub use script::classify_line;

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use tracing::warn;

use crate::device::DeviceEvent;

type EventHandler = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

const READ_CHUNK: usize = 4096;

/// Read `reader` until EOF, handing each chunk to `emit`.
///
/// A UTF-8 sequence cut by a read boundary is held back and sent with the
/// next chunk, so text never arrives split mid-character.
fn pump_chunks(mut reader: impl Read, emit: impl Fn(Vec<u8>)) {
    let mut buf = [0u8; READ_CHUNK];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let complete = complete_prefix(&pending);
                if complete > 0 {
                    let tail = pending.split_off(complete);
                    emit(std::mem::replace(&mut pending, tail));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Output read failed: {}", e);
                break;
            }
        }
    }
    if !pending.is_empty() {
        emit(pending);
    }
}

/// Length of `bytes` without a trailing, unfinished UTF-8 sequence
fn complete_prefix(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let width = match bytes[i] {
            0x80..=0xbf => continue,
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => return len,
        };
        return if len - i < width { i } else { len };
    }
    len
}

/// Read `reader` line by line until EOF. Invalid UTF-8 is replaced, not fatal.
fn pump_lines(reader: impl Read, emit: impl Fn(String)) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if line.ends_with(b"\n") {
                    line.pop();
                    if line.ends_with(b"\r") {
                        line.pop();
                    }
                }
                emit(String::from_utf8_lossy(&line).into_owned());
            }
            Err(e) => {
                warn!("Script output read failed: {}", e);
                break;
            }
        }
    }
}
