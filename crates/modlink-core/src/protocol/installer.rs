//! Chunked firmware upload
//!
//! The image is written with install-chunk commands, one at a time. Each
//! chunk waits for its acknowledgement before the next is sent, so the device
//! paces the transfer. The first chunk is a short probe; the device uses it to
//! validate the image header before the bulk of the data arrives.

use std::ops::Range;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::commands::ControlCommand;
use super::packet::Reply;
use super::ProtocolError;
use crate::config::InstallConfig;

/// Anything that can send a control command and await its reply
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    async fn request(&self, command: ControlCommand) -> Result<Reply, ProtocolError>;
}

/// Upload progress, reported after every acknowledged chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    pub acknowledged: usize,
    pub total: usize,
}

impl InstallProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.acknowledged as f64 / self.total as f64
    }
}

/// Byte ranges of each chunk for an image of `len` bytes
///
/// One probe of `probe_size`, then `chunk_size` pieces until the end. An
/// image no longer than the probe is sent as a single chunk.
pub fn plan_chunks(len: usize, probe_size: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    if len == 0 {
        return chunks;
    }
    let first = probe_size.max(1).min(len);
    chunks.push(0..first);
    let step = chunk_size.max(1);
    let mut offset = first;
    while offset < len {
        let end = (offset + step).min(len);
        chunks.push(offset..end);
        offset = end;
    }
    chunks
}

/// Writes firmware images through a [`ReplyChannel`]
#[derive(Debug, Clone, Default)]
pub struct FirmwareInstaller {
    config: InstallConfig,
}

impl FirmwareInstaller {
    pub fn new(config: InstallConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    /// Upload `image`, calling `progress` after each acknowledged chunk
    ///
    /// Returns the code of the final acknowledgement. The first non-zero code
    /// stops the upload with [`ProtocolError::Install`]; nothing is retried.
    pub async fn install<C, F>(
        &self,
        channel: &C,
        image: &[u8],
        mut progress: F,
    ) -> Result<i16, ProtocolError>
    where
        C: ReplyChannel + ?Sized,
        F: FnMut(InstallProgress) + Send,
    {
        if image.is_empty() {
            return Err(ProtocolError::InvalidImage("image is empty".into()));
        }
        if u32::try_from(image.len()).is_err() {
            return Err(ProtocolError::InvalidImage(format!(
                "image of {} bytes exceeds the 32-bit offset range",
                image.len()
            )));
        }

        let chunks = plan_chunks(image.len(), self.config.probe_size, self.config.chunk_size);
        info!(
            bytes = image.len(),
            chunks = chunks.len(),
            "starting firmware install"
        );

        let mut last_code = 0;
        for range in chunks {
            // fits: length was checked against u32 above
            let offset = range.start as u32;
            let reply = channel
                .request(ControlCommand::InstallChunk {
                    offset,
                    data: image[range.clone()].to_vec(),
                })
                .await?;

            if !reply.is_success() {
                warn!(offset, code = reply.code, "install chunk rejected");
                return Err(ProtocolError::Install {
                    offset,
                    code: reply.code,
                });
            }
            debug!(offset, len = range.len(), "install chunk acknowledged");
            last_code = reply.code;
            progress(InstallProgress {
                acknowledged: range.end,
                total: image.len(),
            });
        }

        info!(bytes = image.len(), "firmware install complete");
        Ok(last_code)
    }
}
