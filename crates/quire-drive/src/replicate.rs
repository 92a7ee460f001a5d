use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use quire_log::{ProtocolOptions, Replication};

use crate::drive::Drive;
use crate::error::DriveResult;

/// Feeds replicated per drive: metadata and content.
pub const DRIVE_FEEDS: u32 = 2;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateOptions {
    /// Overrides the drive's `max_requests`.
    pub max_requests: Option<usize>,
}

impl Drive {
    /// Replicate this drive with a peer over `transport`.
    ///
    /// The metadata feed starts replicating at once. The content feed joins
    /// the same stream as soon as it is attached, which on a fresh replica
    /// happens once entry 0 of the metadata feed has arrived.
    pub fn replicate<T>(&self, transport: T, options: ReplicateOptions) -> DriveResult<Replication>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let replication = Replication::new(
            transport,
            ProtocolOptions {
                expected_feeds: DRIVE_FEEDS,
                max_requests: options
                    .max_requests
                    .unwrap_or(self.inner.config.max_requests),
            },
        );
        replication.add_feed(&self.inner.metadata)?;

        let drive = self.clone();
        let stream = replication.clone();
        tokio::spawn(async move {
            tokio::select! {
                content = drive.ensure_content() => match content {
                    Ok(content) => {
                        if let Err(e) = stream.add_feed(&content) {
                            debug!(drive = %drive.key().short_id(), error = %e, "content not replicated");
                        }
                    }
                    Err(e) => {
                        warn!(drive = %drive.key().short_id(), error = %e, "content resolution failed; replicating metadata only");
                    }
                },
                _ = stream.finished() => {
                    debug!(drive = %drive.key().short_id(), "stream closed before content was attached");
                }
            }
        });
        Ok(replication)
    }
}
