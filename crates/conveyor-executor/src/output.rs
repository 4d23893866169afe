//! Bounded capture of step output.

use conveyor_core::run::CapturedOutput;

/// Replacement for secret values in captured output.
pub const MASK: &str = "***";

/// Accumulates combined output up to a byte limit.
///
/// Past the limit, lines are counted and dropped so the child's pipes keep
/// draining; [`OutputBuffer::finish`] appends a truncation marker.
#[derive(Debug)]
pub struct OutputBuffer {
    limit: usize,
    text: String,
    dropped: u64,
    masks: Vec<String>,
}

impl OutputBuffer {
    pub fn new(limit: usize, masks: impl IntoIterator<Item = String>) -> Self {
        let mut masks: Vec<String> = masks.into_iter().filter(|m| !m.is_empty()).collect();
        // Longest first, so a secret containing another is masked whole.
        masks.sort_by_key(|m| std::cmp::Reverse(m.len()));
        Self {
            limit,
            text: String::new(),
            dropped: 0,
            masks,
        }
    }

    /// Replace every secret value in `line` with [`MASK`].
    pub fn mask(&self, line: &str) -> String {
        self.masks
            .iter()
            .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }

    /// Append one line (without its newline).
    pub fn push_line(&mut self, line: &str) {
        let needed = line.len() + 1;
        let remaining = self.limit.saturating_sub(self.text.len());

        if self.dropped == 0 && needed <= remaining {
            self.text.push_str(line);
            self.text.push('\n');
            return;
        }

        if self.dropped == 0 && remaining > 0 {
            let mut cut = remaining.min(line.len());
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            self.text.push_str(&line[..cut]);
            self.dropped += (needed - cut) as u64;
        } else {
            self.dropped += needed as u64;
        }
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn finish(mut self) -> CapturedOutput {
        if self.dropped > 0 {
            if !self.text.ends_with('\n') && !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(&format!(
                "[conveyor: output truncated, {} bytes omitted]\n",
                self.dropped
            ));
        }
        CapturedOutput {
            text: self.text,
            truncated_bytes: self.dropped,
        }
    }
}
