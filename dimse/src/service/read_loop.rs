//! Incoming PDU handling.
use std::sync::Arc;

use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

use super::*;
use crate::message::{DicomMessage, Message};
use crate::pdu::{
    read_pdu_body, AbortRQServiceProviderReason, AssociationAC, AssociationRQ, PDataValue,
    PduHeader, KEEP_ALIVE_PDU_TYPE,
};

/// What to do after handling a PDU.
enum Flow {
    Continue,
    Close(Option<Error>),
}

pub(crate) async fn run<R>(inner: Arc<Inner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reassembler = Reassembler::new();
    loop {
        let received = tokio::select! {
            received = inner.read_pdu(&mut reader) => received,
            _ = inner.closed() => return,
        };

        let flow = match received {
            Ok(Some(pdu)) => match inner.handle_pdu(pdu, &mut reassembler).await {
                Ok(flow) => flow,
                Err(error) => {
                    inner.abort_on(&error);
                    Flow::Close(Some(error))
                }
            },
            Ok(None) => match inner.state() {
                AssociationState::Idle => {
                    debug!("Connection closed before association request");
                    Flow::Close(None)
                }
                _ => Flow::Close(Some(PeerClosedSnafu.build())),
            },
            Err(error) => {
                inner.abort_on(&error);
                Flow::Close(Some(error))
            }
        };

        if let Flow::Close(error) = flow {
            inner.close(error);
            return;
        }
    }
}

/// Read one full PDU, or `None` if the stream ended between PDUs.
async fn read_pdu_from<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 6];
    let n = reader.read(&mut header[..1]).await.context(TransportSnafu)?;
    if n == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .context(TransportSnafu)?;
    let header = PduHeader::parse(header);
    header
        .check_length(max_pdu_length, strict)
        .context(MalformedPduSnafu)?;

    let mut body = vec![0; header.length as usize];
    reader.read_exact(&mut body).await.context(TransportSnafu)?;
    read_pdu_body(header.pdu_type, &body)
        .context(MalformedPduSnafu)
        .map(Some)
}

impl Inner {
    async fn read_pdu<R>(&self, reader: &mut R) -> Result<Option<Pdu>>
    where
        R: AsyncRead + Unpin,
    {
        let read = read_pdu_from(
            reader,
            self.options.get_max_pdu_length(),
            self.options.is_strict(),
        );
        match self.options.get_read_timeout() {
            Some(duration) => tokio::time::timeout(duration, read)
                .await
                .ok()
                .context(TimeoutSnafu { duration })?,
            None => read.await,
        }
    }

    /// Send an A-ABORT if the error calls for one.
    fn abort_on(&self, error: &Error) {
        let reason = match error {
            Error::UnrecognizedPdu { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
            Error::MalformedPdu { .. } => AbortRQServiceProviderReason::InvalidPduParameter,
            Error::ProtocolViolation { .. }
            | Error::Reassembly { .. }
            | Error::StorageTask { .. }
            | Error::Timeout { .. }
            | Error::InvalidAssociation { .. } => AbortRQServiceProviderReason::ReasonNotSpecified,
            _ => return,
        };
        self.request_abort(AbortRQSource::ServiceProvider(reason));
    }

    async fn handle_pdu(self: &Arc<Self>, pdu: Pdu, reassembler: &mut Reassembler) -> Result<Flow> {
        let state = self.state();
        match &pdu {
            Pdu::PData { .. } => {
                if self.options.get_log_data_pdus() {
                    trace!("Received {}", pdu.short_description());
                }
            }
            _ => debug!("Received {}", pdu.short_description()),
        }

        match (state, pdu) {
            (_, Pdu::Unknown { pdu_type, .. }) if pdu_type == KEEP_ALIVE_PDU_TYPE => {
                Ok(Flow::Continue)
            }
            (_, Pdu::Unknown { pdu_type, .. }) => UnrecognizedPduSnafu { pdu_type }.fail(),
            (_, Pdu::AbortRQ { source }) => {
                warn!("Association aborted by peer: {}", source);
                self.events.on_abort(&source);
                Ok(Flow::Close(Some(
                    AbortedSnafu {
                        abort_source: source,
                    }
                    .build(),
                )))
            }
            (AssociationState::Idle, Pdu::AssociationRQ(rq)) => {
                self.on_association_request(rq).await
            }
            (AssociationState::RequestSent, Pdu::AssociationAC(ac)) => {
                self.on_association_accept(ac)
            }
            (AssociationState::RequestSent, Pdu::AssociationRJ(association_rj)) => {
                info!("Association rejected: {}", association_rj.source);
                if let Events::User(user) = &self.events {
                    user.on_association_reject(&association_rj);
                }
                Ok(Flow::Close(Some(RejectedSnafu { association_rj }.build())))
            }
            (AssociationState::Established | AssociationState::Releasing, Pdu::PData { data }) => {
                for pdv in data {
                    self.on_pdv(pdv, reassembler).await?;
                }
                Ok(Flow::Continue)
            }
            (AssociationState::Established | AssociationState::Releasing, Pdu::ReleaseRQ) => {
                info!("Association release requested by peer");
                if let Events::Provider(provider) = &self.events {
                    provider.on_release_request();
                }
                self.send_pdu(Pdu::ReleaseRP).await;
                Ok(Flow::Close(None))
            }
            (AssociationState::Releasing, Pdu::ReleaseRP) => {
                info!("Association released");
                if let Events::User(user) = &self.events {
                    user.on_release_response();
                }
                Ok(Flow::Close(None))
            }
            (state, pdu) => ProtocolViolationSnafu {
                what: pdu.short_description().to_string(),
                state,
            }
            .fail(),
        }
    }

    async fn on_association_request(&self, rq: AssociationRQ) -> Result<Flow> {
        let Events::Provider(provider) = &self.events else {
            return ProtocolViolationSnafu {
                what: "A-ASSOCIATE-RQ",
                state: AssociationState::Idle,
            }
            .fail();
        };
        self.set_state(AssociationState::RequestReceived);
        if self.options.get_use_remote_ae_for_log_name() {
            self.span.record("peer", rq.calling_ae_title.trim());
        }

        let mut association = Association::from_request(&rq, self.options.get_max_pdu_length())
            .context(InvalidAssociationSnafu)?;
        association.limit_async_ops_window(self.options.get_max_async_ops_invoked());

        match provider.on_association_request(&mut association) {
            Ok(()) => {
                let ac = association.accept();
                let accepted = association
                    .presentation_contexts()
                    .iter()
                    .filter(|pc| pc.is_accepted())
                    .count();
                info!(
                    "Association accepted: {} -> {}, {} of {} presentation contexts",
                    association.calling_ae_title(),
                    association.called_ae_title(),
                    accepted,
                    association.presentation_contexts().len()
                );
                self.shared().association = Some(Arc::new(association));
                self.send_pdu(Pdu::AssociationAC(ac)).await;
                self.set_state(AssociationState::Established);
                self.wake_sender.notify_one();
                Ok(Flow::Continue)
            }
            Err(association_rj) => {
                info!(
                    "Rejecting association from {}: {}",
                    association.calling_ae_title(),
                    association_rj.source
                );
                self.send_pdu(Pdu::AssociationRJ(association_rj)).await;
                Ok(Flow::Close(None))
            }
        }
    }

    fn on_association_accept(&self, ac: AssociationAC) -> Result<Flow> {
        let Events::User(user) = &self.events else {
            return ProtocolViolationSnafu {
                what: "A-ASSOCIATE-AC",
                state: AssociationState::RequestSent,
            }
            .fail();
        };
        let mut association = self
            .shared()
            .proposed
            .take()
            .context(ProtocolViolationSnafu {
                what: "A-ASSOCIATE-AC",
                state: AssociationState::RequestSent,
            })?;
        association
            .apply_accept(&ac)
            .context(InvalidAssociationSnafu)?;

        let accepted = association
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.is_accepted())
            .count();
        info!(
            "Association established with {}, {} of {} presentation contexts accepted",
            association.called_ae_title(),
            accepted,
            association.presentation_contexts().len()
        );
        let association = Arc::new(association);
        self.shared().association = Some(Arc::clone(&association));
        self.set_state(AssociationState::Established);
        user.on_association_accept(&association);
        self.wake_sender.notify_one();
        Ok(Flow::Continue)
    }

    async fn on_pdv(
        self: &Arc<Self>,
        pdv: PDataValue,
        reassembler: &mut Reassembler,
    ) -> Result<()> {
        if self.options.get_log_data_pdus() {
            trace!(
                "PDV: context {}, {:?}{}, {} bytes",
                pdv.presentation_context_id,
                pdv.value_type,
                if pdv.is_last { " (last)" } else { "" },
                pdv.data.len()
            );
        }

        let id = pdv.presentation_context_id;
        let transfer_syntax = self
            .shared()
            .association
            .as_ref()
            .and_then(|association| association.presentation_context(id))
            .and_then(|pc| pc.accepted_transfer_syntax())
            .map(str::to_string)
            .with_context(|| ProtocolViolationSnafu {
                what: format!("data on presentation context {}", id),
                state: self.state(),
            })?;

        let to_storage = self.capabilities.c_store.is_some() && reassembler.touches_storage(&pdv);
        let reassembled = if to_storage {
            // sinks may block on file I/O
            let mut owned = std::mem::take(reassembler);
            let storage = Arc::clone(&self.storage);
            let (owned, reassembled) = tokio::task::spawn_blocking(move || {
                let reassembled = owned.push(pdv, &transfer_syntax, Some(&*storage));
                (owned, reassembled)
            })
            .await
            .context(StorageTaskSnafu)?;
            *reassembler = owned;
            reassembled
        } else {
            let storage = self
                .capabilities
                .c_store
                .as_ref()
                .map(|_| &*self.storage);
            reassembler.push(pdv, &transfer_syntax, storage)
        };
        let reassembled = reassembled.context(ReassemblySnafu)?;

        match reassembled {
            None => {}
            Some(Reassembled::Message(message)) => self.on_message(message),
            Some(Reassembled::DatasetError { mut message, error }) => {
                message.set_dataset(None);
                self.on_dataset_error(message, error)
            }
            Some(Reassembled::Store {
                message,
                meta,
                sink,
            }) => match DicomRequest::from_message(message) {
                Ok(request) => self.dispatch_store(request, meta, Ok(sink)),
                Err(e) => warn!("Dropping C-STORE request: {}", e),
            },
            Some(Reassembled::StoreFailed {
                message,
                meta,
                error,
            }) => match DicomRequest::from_message(message) {
                Ok(request) => self.dispatch_store(request, meta, Err(error)),
                Err(e) => warn!("Dropping C-STORE request: {}", e),
            },
        }
        Ok(())
    }

    fn on_message(self: &Arc<Self>, message: DicomMessage) {
        self.log_message("Received", &message);
        match Message::from_message(message) {
            Message::Request(request) => {
                info!("Received {}", request);
                self.dispatch(request);
            }
            Message::Response(response) => self.deliver(response),
            Message::Unknown(message) => {
                warn!(
                    "Dropping message with unknown command field {:#06x}",
                    message.command_field_code().unwrap_or_default()
                );
            }
        }
    }

    fn on_dataset_error(&self, message: DicomMessage, error: message::Error) {
        let error = Error::DecodeDataset { source: error };
        match Message::from_message(message) {
            Message::Request(request) => {
                warn!("{}: {}", request, snafu::Report::from_error(&error));
                self.enqueue_response(
                    DicomResponse::new(&request, Status::PROCESSING_FAILURE)
                        .with_error_comment(error.to_string()),
                );
            }
            Message::Response(response) => {
                warn!("{}: {}", response, snafu::Report::from_error(&error));
                self.deliver(response);
            }
            Message::Unknown(_) => warn!("{}", snafu::Report::from_error(&error)),
        }
    }

    /// Hand a response over to the request it answers.
    fn deliver(&self, response: DicomResponse) {
        info!("Received {}", response);
        let Some(message_id) = response.request_message_id() else {
            warn!("Dropping {}: no message ID being responded to", response);
            return;
        };

        let terminal = !response.is_pending();
        {
            let mut shared = self.shared();
            let Some(pending) = shared.pending.get(&message_id) else {
                warn!("Dropping {}: no such pending request", response);
                return;
            };
            if pending.field.response() != response.field() {
                warn!(
                    "{} answers a {} request",
                    response.field(),
                    pending.field
                );
            }
            let _ = pending.sender.send(response);
            if !terminal {
                return;
            }
            shared.pending.remove(&message_id);
            self.refresh_idle(&shared);
        }
        self.wake_sender.notify_one();
    }

    pub(crate) fn log_message(&self, action: &str, message: &DicomMessage) {
        if !self.options.get_log_dimse_datasets() {
            return;
        }
        debug!("{} command set: {:?}", action, message.command());
        if let Some(dataset) = message.dataset() {
            debug!(
                "{} data set ({}): {:?}",
                action,
                dataset.transfer_syntax(),
                dataset.object()
            );
        }
    }
}
