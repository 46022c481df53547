//! Attachment policy for logs
//!
//! Attachments that break the per-session count or size limit never fail the
//! log; the log is tagged with an error code instead of an attachment id.

use crate::telemetry::{keys, Attributes};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Binary data or a reference to data hosted elsewhere
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Data(Vec<u8>),
    Reference { id: String, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentErrorCode {
    OverMaxSize,
    LimitReached,
}

impl AttachmentErrorCode {
    pub fn name(&self) -> &'static str {
        match self {
            AttachmentErrorCode::OverMaxSize => "over_max_size",
            AttachmentErrorCode::LimitReached => "attachment_limit_reached",
        }
    }
}

/// Attachment data accepted for upload
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAttachment {
    pub id: String,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct AttachmentPolicy {
    max_per_session: usize,
    max_size: usize,
    count: Mutex<usize>,
}

impl AttachmentPolicy {
    pub fn new(max_per_session: usize, max_size: usize) -> Self {
        Self {
            max_per_session,
            max_size,
            count: Mutex::new(0),
        }
    }

    /// Tag `attributes` for the attachment and return the data to upload, if any
    pub fn apply(&self, attachment: Attachment, attributes: &mut Attributes) -> Option<PendingAttachment> {
        match attachment {
            Attachment::Reference { id, url } => {
                attributes.insert(keys::ATTACHMENT_ID.to_string(), id);
                attributes.insert(keys::ATTACHMENT_URL.to_string(), url);
                None
            }
            Attachment::Data(data) => {
                if let Err(code) = self.admit(data.len()) {
                    debug!("Attachment of {} bytes rejected: {}", data.len(), code.name());
                    attributes.insert(keys::ATTACHMENT_ERROR_CODE.to_string(), code.name().to_string());
                    attributes.insert(keys::ATTACHMENT_SIZE.to_string(), data.len().to_string());
                    return None;
                }

                let id = Uuid::new_v4().to_string();
                attributes.insert(keys::ATTACHMENT_ID.to_string(), id.clone());
                attributes.insert(keys::ATTACHMENT_SIZE.to_string(), data.len().to_string());
                Some(PendingAttachment { id, data })
            }
        }
    }

    fn admit(&self, size: usize) -> Result<(), AttachmentErrorCode> {
        let mut count = self.count.lock();
        if *count >= self.max_per_session {
            return Err(AttachmentErrorCode::LimitReached);
        }
        if size > self.max_size {
            return Err(AttachmentErrorCode::OverMaxSize);
        }
        *count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Give back the slot of an accepted attachment whose log was never stored
    pub fn release(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
    }

    /// Start counting again for a new session
    pub fn reset(&self) {
        *self.count.lock() = 0;
    }
}
