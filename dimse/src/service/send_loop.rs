//! Outgoing message scheduling and PDU transmission.
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use super::*;
use crate::message::{DicomMessage, Dataset};
use crate::pdu::encode_pdu;

/// What the scheduler should do next.
enum Next {
    Send(Outgoing, Arc<Association>),
    /// nothing can be sent right now
    Wait { queue_emptied: bool },
    Stop,
}

/// Take messages from the send queue and turn them into PDUs,
/// one message at a time.
pub(crate) async fn run_scheduler(inner: Arc<Inner>) {
    loop {
        match inner.next_outgoing() {
            Next::Send(item, association) => inner.transmit(item, &association).await,
            Next::Wait { queue_emptied } => {
                if queue_emptied {
                    if let Events::User(user) = &inner.events {
                        user.on_send_queue_empty();
                    }
                }
                tokio::select! {
                    _ = inner.wake_sender.notified() => {}
                    _ = inner.closed() => return,
                }
            }
            Next::Stop => return,
        }
    }
}

/// How long a closing connection may spend on its last PDUs.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Write queued PDUs to the transport in order.
///
/// Once the connection is closed,
/// an A-ABORT is written in place of anything left in the queue.
/// Otherwise the queue is flushed,
/// within [`FLUSH_TIMEOUT`],
/// before the transport is shut down.
/// An abort gives up on a PDU the transport is not accepting,
/// leaving it partially written.
pub(crate) async fn run_writer<W>(inner: Arc<Inner>, mut pdus: mpsc::Receiver<Pdu>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut interrupted = false;
    loop {
        let pdu = tokio::select! {
            biased;
            _ = inner.closed() => break,
            pdu = pdus.recv() => match pdu {
                Some(pdu) => pdu,
                None => break,
            },
        };

        let mut write = std::pin::pin!(inner.write_pdu(&mut writer, &pdu));
        let written = tokio::select! {
            biased;
            written = &mut write => Some(written),
            _ = inner.closed() => None,
        };
        let written = match written {
            Some(written) => written,
            None if inner.is_aborting() => {
                interrupted = true;
                break;
            }
            None => match tokio::time::timeout(FLUSH_TIMEOUT, &mut write).await {
                Ok(written) => written,
                Err(_) => {
                    interrupted = true;
                    break;
                }
            },
        };
        if let Err(error) = written {
            inner.close(Some(error));
            return;
        }
    }

    if interrupted {
        debug!("Giving up on a partially written PDU");
    } else {
        let abort = inner.shared().abort.take();
        let flush = async {
            match abort {
                Some(source) => {
                    inner
                        .write_pdu(&mut writer, &Pdu::AbortRQ { source })
                        .await
                }
                None => {
                    while let Ok(pdu) = pdus.try_recv() {
                        if let Err(error) = inner.write_pdu(&mut writer, &pdu).await {
                            return Err(error);
                        }
                    }
                    Ok(())
                }
            }
        };
        match tokio::time::timeout(FLUSH_TIMEOUT, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!("Could not flush the send queue: {}", error),
            Err(_) => debug!("Timed out flushing the send queue"),
        }
    }
    match tokio::time::timeout(FLUSH_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Could not shut down transport: {}", e),
        Err(_) => debug!("Timed out shutting down transport"),
    }
}

impl Inner {
    fn next_outgoing(&self) -> Next {
        let mut shared = self.shared();
        if shared.closing {
            return Next::Stop;
        }
        let state = self.state();
        let association = match state {
            AssociationState::Established | AssociationState::Releasing => {
                shared.association.clone()
            }
            _ => None,
        };
        let Some(association) = association else {
            shared.sending = false;
            return Next::Wait {
                queue_emptied: false,
            };
        };

        let limit = match self.events {
            Events::User(_) => association.max_async_ops_invoked(),
            Events::Provider(_) => association.max_async_ops_performed(),
        };
        let admitted = state == AssociationState::Established
            && (limit == 0 || shared.pending.len() < usize::from(limit));
        let position = shared.queue.iter().position(|item| match item {
            Outgoing::Response(_) => true,
            Outgoing::Request { request, .. } if request.field() == CommandField::CCancelRq => {
                true
            }
            Outgoing::Request { .. } => admitted,
        });

        match position.and_then(|i| shared.queue.remove(i)) {
            Some(item) => {
                shared.sending = true;
                self.refresh_idle(&shared);
                Next::Send(item, association)
            }
            None => {
                shared.sending = false;
                let queue_emptied = shared.is_idle() && !shared.empty_notified;
                if queue_emptied {
                    shared.empty_notified = true;
                }
                self.refresh_idle(&shared);
                Next::Wait { queue_emptied }
            }
        }
    }

    async fn transmit(&self, item: Outgoing, association: &Association) {
        match item {
            Outgoing::Request { request, sender } => {
                self.transmit_request(request, sender, association).await
            }
            Outgoing::Response(response) => self.transmit_response(response, association).await,
        }
    }

    async fn transmit_request(
        &self,
        mut request: DicomRequest,
        sender: mpsc::UnboundedSender<DicomResponse>,
        association: &Association,
    ) {
        let field = request.field();
        let message_id = request.message_id().unwrap_or_default();

        if field == CommandField::CCancelRq {
            let cancelled = request.cancelled_message_id().unwrap_or_default();
            let id = self
                .shared()
                .pending
                .get(&cancelled)
                .map(|pending| pending.presentation_context_id);
            match id {
                Some(id) => {
                    request.message_mut().set_presentation_context_id(id);
                    self.send_message(request.message(), id, association).await;
                }
                None => debug!("Not sending C-CANCEL: request {} is not pending", cancelled),
            }
            return;
        }

        let sop_class_uid = request.sop_class_uid().unwrap_or_default();
        let preferred = match field {
            CommandField::CStoreRq => request.message().dataset().map(Dataset::transfer_syntax),
            _ => None,
        };
        let Some(pc) = association.select_context(&sop_class_uid, preferred) else {
            let error = UnsupportedPresentationContextSnafu { sop_class_uid }.build();
            warn!("Cannot send {}: {}", request, error);
            let _ = sender.send(
                DicomResponse::new(&request, Status::SOP_CLASS_NOT_SUPPORTED)
                    .with_error_comment(error.to_string()),
            );
            return;
        };
        let id = pc.id();
        request.message_mut().set_presentation_context_id(id);

        if let Err(error) = self.prepare_dataset(request.message_mut(), association) {
            warn!("Cannot send {}: {}", request, snafu::Report::from_error(&error));
            let _ = sender.send(
                DicomResponse::new(&request, Status::PROCESSING_FAILURE)
                    .with_error_comment(error.to_string()),
            );
            return;
        }

        {
            let mut shared = self.shared();
            if shared.closing {
                return;
            }
            shared.pending.insert(
                message_id,
                PendingRequest {
                    field,
                    presentation_context_id: id,
                    sender,
                },
            );
        }
        info!("Sending {}", request);
        if !self.send_message(request.message(), id, association).await {
            // the message never made it out
            let mut shared = self.shared();
            if let Some(pending) = shared.pending.remove(&message_id) {
                let _ = pending.sender.send(
                    DicomResponse::new(&request, Status::PROCESSING_FAILURE)
                        .with_error_comment("could not encode request"),
                );
            }
            self.refresh_idle(&shared);
        }
    }

    async fn transmit_response(&self, mut response: DicomResponse, association: &Association) {
        let Some(id) = response.message().presentation_context_id() else {
            warn!("Dropping {}: no presentation context", response);
            return;
        };
        if let Err(error) = self.prepare_dataset(response.message_mut(), association) {
            warn!(
                "Sending {} without its data set: {}",
                response,
                snafu::Report::from_error(&error)
            );
            response.message_mut().set_dataset(None);
            response = response
                .with_status(Status::PROCESSING_FAILURE)
                .with_error_comment(error.to_string());
        }
        info!("Sending {}", response);
        self.send_message(response.message(), id, association).await;
    }

    /// Strip group lengths from the data set and convert it
    /// to the transfer syntax of the message's presentation context.
    fn prepare_dataset(&self, message: &mut DicomMessage, association: &Association) -> Result<()> {
        let id = message.presentation_context_id().unwrap_or_default();
        let Some(dataset) = message.dataset_mut() else {
            return Ok(());
        };
        let transfer_syntax = association
            .presentation_context(id)
            .and_then(|pc| pc.accepted_transfer_syntax())
            .with_context(|| ProtocolViolationSnafu {
                what: format!("message on presentation context {}", id),
                state: self.state(),
            })?;
        dataset.remove_group_lengths();
        self.transcoder
            .transcode(dataset, transfer_syntax)
            .context(TranscodeSnafu)
    }

    /// Encode a message and queue its PDUs.
    ///
    /// Returns `false` if the message could not be encoded.
    async fn send_message(&self, message: &DicomMessage, id: u8, association: &Association) -> bool {
        self.log_message("Sending", message);
        let encoded = message.encode_command().and_then(|command| {
            let dataset = message.dataset().map(Dataset::encode).transpose()?;
            Ok((command, dataset))
        });
        let (command, dataset) = match encoded.context(EncodeMessageSnafu) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!("{}", snafu::Report::from_error(&error));
                return false;
            }
        };

        let fragmenter = PDataFragmenter::new(
            id,
            association.max_pdu_length(),
            self.options.get_max_command_buffer(),
            self.options.get_max_data_buffer(),
        );
        for pdu in fragmenter.fragments(&command, dataset.as_deref()) {
            if !self.send_pdu(pdu).await {
                // closing, pending requests are dropped with the connection
                break;
            }
        }
        true
    }

    async fn write_pdu<W>(&self, writer: &mut W, pdu: &Pdu) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match pdu {
            Pdu::PData { .. } => {
                if self.options.get_log_data_pdus() {
                    trace!("Sending {}", pdu.short_description());
                }
            }
            _ => debug!("Sending {}", pdu.short_description()),
        }
        let bytes = encode_pdu(pdu).context(EncodePduSnafu)?;
        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        match self.options.get_write_timeout() {
            Some(duration) => tokio::time::timeout(duration, write)
                .await
                .ok()
                .context(TimeoutSnafu { duration })?
                .context(TransportSnafu),
            None => write.await.context(TransportSnafu),
        }
    }
}
