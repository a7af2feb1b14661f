//! Frame capture files.
//!
//! One hex-encoded `FromRadio` frame per line. Blank lines and `#` comments are
//! skipped and whitespace inside a line is ignored. A line holding only `---`
//! splits the frames the radio answers the handshake with from the frames it
//! delivers afterwards; without it every frame is part of the handshake.
//!
//! ```text
//! # my_info, node 0x0a0b0c0d
//! 1a 05 08 8d 98 ac 50
//! ---
//! # rebooted
//! 40 01
//! ```

use anyhow::{anyhow, Result};
use bytes::Bytes;
use thiserror::Error;

pub const SEPARATOR: &str = "---";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("line {line}: invalid hex: {source}")]
    Hex {
        line: usize,
        #[source]
        source: hex::FromHexError,
    },
    #[error("line {line}: second '---' separator")]
    DuplicateSeparator { line: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capture {
    pub bootstrap: Vec<Bytes>,
    pub live: Vec<Bytes>,
}

impl Capture {
    pub fn parse(text: &str) -> Result<Self, CaptureError> {
        let mut capture = Capture::default();
        let mut in_live = false;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == SEPARATOR {
                if in_live {
                    return Err(CaptureError::DuplicateSeparator { line: idx + 1 });
                }
                in_live = true;
                continue;
            }
            let digits: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            let frame = hex::decode(&digits).map_err(|source| CaptureError::Hex {
                line: idx + 1,
                source,
            })?;
            if in_live {
                capture.live.push(Bytes::from(frame));
            } else {
                capture.bootstrap.push(Bytes::from(frame));
            }
        }
        Ok(capture)
    }

    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read capture file {}: {}", path, e))?;
        Capture::parse(&content).map_err(|e| anyhow!("Failed to parse capture file {}: {}", path, e))
    }

    /// Every frame in file order.
    pub fn frames(&self) -> impl Iterator<Item = &Bytes> {
        self.bootstrap.iter().chain(self.live.iter())
    }

    pub fn len(&self) -> usize {
        self.bootstrap.len() + self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
