//! Line framing for agent output streams

/// Splits a byte stream into whole lines
///
/// Complete lines come out of `push` as soon as their newline arrives; a
/// trailing partial line is held until more bytes complete it or `finish`
/// flushes it once at end of stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(clean(&line[..line.len() - 1]));
        }
        lines
    }

    /// Flush the held partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = clean(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn clean(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = strip_ansi_escapes::strip_str(&text);
    text.trim_end_matches('\r').to_string()
}
