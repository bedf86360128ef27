//! Lazy, idempotent stream provisioning

use crate::error::{BrokerError, MessagingError, MessagingResult};
use crate::messaging::broker::{BrokerConnection, StreamInfo};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ensures a durable stream exists for a subject before durable publish or
/// pull consumption.
#[derive(Clone)]
pub struct StreamProvisioner {
    broker: Arc<dyn BrokerConnection>,
}

impl StreamProvisioner {
    pub fn new(broker: Arc<dyn BrokerConnection>) -> Self {
        Self { broker }
    }

    /// Look up the stream for `subject` and create it if absent.
    ///
    /// Safe to call concurrently: losing a creation race to another caller
    /// counts as success. A no-op on connections without durable-log support.
    /// Stream names are derived lossily, so a stream found under the derived
    /// name must also capture `subject`.
    pub async fn ensure(&self, subject: &str) -> MessagingResult<()> {
        let Some(durable) = self.broker.durable() else {
            return Ok(());
        };

        let provisioning_error = |source: BrokerError| MessagingError::StreamProvisioning {
            subject: subject.to_string(),
            source,
        };

        match durable.stream_info(subject).await {
            Ok(info) => {
                bound_to(&info, subject).map_err(provisioning_error)?;
                debug!(subject = subject, stream = %info.name, "Stream already provisioned");
                Ok(())
            }
            Err(BrokerError::StreamNotFound) => match durable.create_stream(subject).await {
                Ok(()) => {
                    info!(subject = subject, "Stream created");
                    Ok(())
                }
                Err(BrokerError::StreamAlreadyExists) => {
                    let info = durable.stream_info(subject).await.map_err(provisioning_error)?;
                    bound_to(&info, subject).map_err(provisioning_error)?;
                    debug!(subject = subject, "Stream created concurrently by another caller");
                    Ok(())
                }
                Err(e) => Err(provisioning_error(e)),
            },
            Err(e) => Err(provisioning_error(e)),
        }
    }
}

fn bound_to(info: &StreamInfo, subject: &str) -> Result<(), BrokerError> {
    if info.subjects.iter().any(|bound| bound == subject) {
        return Ok(());
    }
    warn!(
        subject = subject,
        stream = %info.name,
        bound = ?info.subjects,
        "Stream name collides with a stream for another subject"
    );
    Err(BrokerError::SubjectConflict {
        stream: info.name.clone(),
        bound: info.subjects.clone(),
    })
}
