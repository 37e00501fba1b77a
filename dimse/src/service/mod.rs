//! The connection engine.
//!
//! A [`DicomService`] owns one transport stream
//! and drives a single association over it.
//! Three tasks run per connection:
//!
//! - the read loop, which decodes incoming PDUs,
//!   advances the association state machine,
//!   reassembles DIMSE messages
//!   and hands requests over to the application's providers;
//! - the send scheduler, which takes outgoing messages
//!   one at a time from the send queue,
//!   subject to the negotiated asynchronous operations window,
//!   and cuts them into P-DATA-TF PDUs;
//! - the writer, which puts PDUs on the wire in order.
//!
//! The writer consumes a bounded channel of PDUs,
//! so a message producing more PDUs than
//! [`max_pdus_in_queue`](ServiceOptions::max_pdus_in_queue)
//! suspends the scheduler until the transport catches up.
//!
//! Requests are handled on the runtime's blocking thread pool,
//! so a slow provider does not stall the connection.
//!
//! # Example
//!
//! ```no_run
//! # use dicom_dimse::association::Association;
//! # use dicom_dimse::message::DicomRequest;
//! # use dicom_dimse::service::DicomServiceBuilder;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:11112").await?;
//! let mut association = Association::new("ECHO-SCU", "ANY-SCP")?;
//! association.add_presentation_context("1.2.840.10008.1.1", ["1.2.840.10008.1.2"])?;
//!
//! let service = DicomServiceBuilder::new()
//!     .request(stream, association, ())
//!     .await?;
//! let response = service.send_request(DicomRequest::c_echo())?.last().await;
//! println!("{:?}", response.map(|r| r.status()));
//! service.release().await?;
//! # Ok(())
//! # }
//! ```
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use crate::association::{self, Association, AssociationState};
use crate::message::{self, CommandField, DicomRequest, DicomResponse, Status};
use crate::pdu::{AbortRQSource, AssociationRJ, Pdu};
use crate::provider::{Capabilities, ServiceProvider, ServiceUser};
use crate::storage::{self, MemoryStorage, StoreStorage};
use crate::transcode::{self, NativeTranscoder, Transcoder};

mod dispatch;
pub mod options;
pub mod pdata;
mod read_loop;
mod send_loop;

pub use options::ServiceOptions;
pub use pdata::{PDataFragmenter, Reassembled, Reassembler};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// received a malformed PDU
    MalformedPdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// could not encode PDU
    EncodePdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    #[snafu(display("unrecognized PDU type {:#04x}", pdu_type))]
    UnrecognizedPdu { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("unexpected {} while association is {}", what, state))]
    ProtocolViolation {
        what: String,
        state: AssociationState,
        backtrace: Backtrace,
    },

    /// could not reassemble incoming message
    Reassembly {
        #[snafu(backtrace)]
        source: pdata::Error,
    },

    #[snafu(display("no accepted presentation context for `{}`", sop_class_uid))]
    UnsupportedPresentationContext {
        sop_class_uid: String,
        backtrace: Backtrace,
    },

    #[snafu(display("no provider for {} requests", field))]
    ServiceNotImplemented {
        field: CommandField,
        backtrace: Backtrace,
    },

    /// could not decode data set
    DecodeDataset {
        #[snafu(backtrace)]
        source: message::Error,
    },

    /// could not encode message
    EncodeMessage {
        #[snafu(backtrace)]
        source: message::Error,
    },

    /// could not transcode data set
    Transcode {
        #[snafu(backtrace)]
        source: transcode::Error,
    },

    /// could not store received instance
    Storage {
        #[snafu(backtrace)]
        source: storage::Error,
    },

    /// storage task failed
    StorageTask {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },

    /// invalid association parameters
    InvalidAssociation {
        #[snafu(backtrace)]
        source: association::Error,
    },

    /// transport failure
    Transport {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("no PDU transferred within {:?}", duration))]
    Timeout {
        duration: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("association aborted: {}", abort_source))]
    Aborted {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },

    /// connection closed by peer
    PeerClosed { backtrace: Backtrace },

    /// association is closed
    Closed { backtrace: Backtrace },

    #[snafu(display("association is {}", state))]
    NotEstablished {
        state: AssociationState,
        backtrace: Backtrace,
    },

    #[snafu(display("message ID {} is already in use", message_id))]
    MessageIdInUse { message_id: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds connection engines sharing the same configuration.
#[derive(Clone)]
pub struct DicomServiceBuilder {
    options: ServiceOptions,
    capabilities: Capabilities,
    storage: Arc<dyn StoreStorage>,
    transcoder: Arc<dyn Transcoder>,
}

impl Default for DicomServiceBuilder {
    fn default() -> Self {
        DicomServiceBuilder {
            options: ServiceOptions::default(),
            capabilities: Capabilities::default(),
            storage: Arc::new(MemoryStorage),
            transcoder: Arc::new(NativeTranscoder),
        }
    }
}

impl fmt::Debug for DicomServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DicomServiceBuilder")
            .field("options", &self.options)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl DicomServiceBuilder {
    pub fn new() -> Self {
        DicomServiceBuilder::default()
    }

    pub fn options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    /// The services which incoming requests are handed over to.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Where the data sets of incoming C-STORE requests are written.
    /// Defaults to [`MemoryStorage`].
    pub fn storage(mut self, storage: impl StoreStorage + 'static) -> Self {
        self.storage = Arc::new(storage);
        self
    }

    /// Converter of outgoing data sets. Defaults to [`NativeTranscoder`].
    pub fn transcoder(mut self, transcoder: impl Transcoder + 'static) -> Self {
        self.transcoder = Arc::new(transcoder);
        self
    }

    /// Serve an incoming connection as the association acceptor.
    ///
    /// The engine waits for the peer's A-ASSOCIATE-RQ
    /// and lets `provider` decide on it.
    /// Must be called within a Tokio runtime.
    pub fn accept<S, P>(&self, stream: S, provider: P) -> DicomService
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        P: ServiceProvider + 'static,
    {
        self.start(stream, Events::Provider(Arc::new(provider)), None)
    }

    /// Request an association over an open connection.
    ///
    /// Resolves once the peer has accepted the association,
    /// or fails with [`Error::Rejected`] if it did not.
    pub async fn request<S, U>(
        &self,
        stream: S,
        mut association: Association,
        user: U,
    ) -> Result<DicomService>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        U: ServiceUser + 'static,
    {
        association
            .set_local_max_pdu_length(self.options.get_max_pdu_length())
            .context(InvalidAssociationSnafu)?;
        let window = self.options.get_max_async_ops_invoked();
        if association.async_ops_window().is_none() && window != 1 {
            association
                .set_async_ops_window(window, window)
                .context(InvalidAssociationSnafu)?;
        }
        let rq = association.to_request();

        let service = self.start(stream, Events::User(Arc::new(user)), Some(association));
        let inner = &service.inner;
        if inner.options.get_use_remote_ae_for_log_name() {
            inner.span.record("peer", rq.called_ae_title.as_str());
        }
        inner.set_state(AssociationState::RequestSent);
        inner.send_pdu(Pdu::AssociationRQ(rq)).await;

        let mut state = inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                AssociationState::Established => return Ok(service),
                AssociationState::Closed => {
                    return Err(inner
                        .take_close_error()
                        .unwrap_or_else(|| PeerClosedSnafu.build()))
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return PeerClosedSnafu.fail();
            }
        }
    }

    fn start<S>(&self, stream: S, events: Events, proposed: Option<Association>) -> DicomService
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outgoing, pdus) = mpsc::channel(self.options.get_max_pdus_in_queue());
        let (state, _) = watch::channel(AssociationState::Idle);
        let (idle, _) = watch::channel(true);
        let span = info_span!("dicom_service", peer = field::Empty);

        let inner = Arc::new(Inner {
            options: self.options.clone(),
            capabilities: self.capabilities.clone(),
            storage: Arc::clone(&self.storage),
            transcoder: Arc::clone(&self.transcoder),
            events,
            span: span.clone(),
            shared: Mutex::new(Shared {
                association: None,
                proposed,
                next_message_id: 1,
                queue: VecDeque::new(),
                pending: HashMap::new(),
                sending: false,
                empty_notified: false,
                closing: false,
                abort: None,
                close_error: None,
            }),
            state,
            idle,
            outgoing,
            wake_sender: Notify::new(),
        });

        tokio::spawn(read_loop::run(Arc::clone(&inner), reader).instrument(span.clone()));
        tokio::spawn(send_loop::run_scheduler(Arc::clone(&inner)).instrument(span.clone()));
        tokio::spawn(send_loop::run_writer(Arc::clone(&inner), pdus, writer).instrument(span));

        DicomService { inner }
    }
}

/// Handle to a running connection engine.
///
/// Clones refer to the same connection.
/// Dropping every handle does not close the connection:
/// call [`release`](DicomService::release) or [`abort`](DicomService::abort).
#[derive(Clone)]
pub struct DicomService {
    inner: Arc<Inner>,
}

impl fmt::Debug for DicomService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DicomService")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DicomService {
    pub fn state(&self) -> AssociationState {
        self.inner.state()
    }

    /// The negotiated association, once established.
    pub fn association(&self) -> Option<Arc<Association>> {
        self.inner.shared().association.clone()
    }

    /// Queue a request for sending.
    ///
    /// A message ID is assigned unless the request already has one.
    /// The returned receiver yields the responses in arrival order
    /// and ends after the terminal one.
    /// C-CANCEL requests receive no responses.
    pub fn send_request(&self, mut request: DicomRequest) -> Result<ResponseReceiver> {
        let (sender, rx) = mpsc::unbounded_channel();
        let message_id = {
            let mut shared = self.inner.shared();
            ensure!(!shared.closing, ClosedSnafu);
            match self.inner.state() {
                AssociationState::Established => {}
                AssociationState::Closed => return ClosedSnafu.fail(),
                state => return NotEstablishedSnafu { state }.fail(),
            }
            let message_id = if request.field() == CommandField::CCancelRq {
                request.cancelled_message_id().unwrap_or(0)
            } else {
                match request.message_id() {
                    Some(id) => {
                        ensure!(
                            !shared.pending.contains_key(&id),
                            MessageIdInUseSnafu { message_id: id }
                        );
                        id
                    }
                    None => {
                        let id = shared.next_message_id();
                        request.message_mut().set_message_id(id);
                        id
                    }
                }
            };
            shared.queue.push_back(Outgoing::Request { request, sender });
            shared.empty_notified = false;
            self.inner.refresh_idle(&shared);
            message_id
        };
        self.inner.wake_sender.notify_one();
        Ok(ResponseReceiver { message_id, rx })
    }

    /// Cancel the operation with the given message ID.
    ///
    /// A request still waiting in the send queue is dropped
    /// and answered locally with status _Cancel_;
    /// otherwise a C-CANCEL request is sent to the peer.
    pub fn cancel(&self, message_id: u16) -> Result<()> {
        {
            let mut shared = self.inner.shared();
            let queued = shared.queue.iter().position(|item| match item {
                Outgoing::Request { request, .. } => {
                    request.field() != CommandField::CCancelRq
                        && request.message_id() == Some(message_id)
                }
                Outgoing::Response(_) => false,
            });
            if let Some(Outgoing::Request { request, sender }) =
                queued.and_then(|i| shared.queue.remove(i))
            {
                info!("Cancelled {} before sending", request);
                let _ = sender.send(DicomResponse::new(&request, Status::CANCEL));
                self.inner.refresh_idle(&shared);
                return Ok(());
            }
        }
        self.send_request(DicomRequest::c_cancel(message_id))
            .map(|_| ())
    }

    /// Release the association gracefully.
    ///
    /// Waits for the send queue to drain and every pending request
    /// to complete before sending A-RELEASE-RQ,
    /// then for the connection to close.
    /// Does nothing if the association is already closed.
    pub async fn release(&self) -> Result<()> {
        match self.state() {
            AssociationState::Established => {}
            AssociationState::Closed => return Ok(()),
            state => return NotEstablishedSnafu { state }.fail(),
        }

        let mut idle = self.inner.idle.subscribe();
        loop {
            if self.inner.is_closed() {
                return Ok(());
            }
            let is_idle = *idle.borrow_and_update();
            if is_idle {
                break;
            }
            tokio::select! {
                changed = idle.changed() => if changed.is_err() { break },
                _ = self.inner.closed() => return Ok(()),
            }
        }

        {
            let _shared = self.inner.shared();
            match self.inner.state() {
                AssociationState::Established => {
                    self.inner.set_state(AssociationState::Releasing)
                }
                AssociationState::Closed => return Ok(()),
                state => return NotEstablishedSnafu { state }.fail(),
            }
        }
        info!("Releasing association");
        self.inner.send_pdu(Pdu::ReleaseRQ).await;
        self.inner.closed().await;
        match self.inner.take_close_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Abort the association and close the connection.
    ///
    /// The association is closed on return,
    /// without waiting for the transport.
    /// PDUs still queued are dropped and the A-ABORT is written in their place,
    /// unless the transport is stuck in the middle of another PDU,
    /// in which case the connection is only shut down.
    /// Outstanding requests end without a terminal response.
    /// Does nothing if the association is already closed.
    pub async fn abort(&self) {
        if self.inner.request_abort(AbortRQSource::ServiceUser) {
            self.inner.close(None);
        }
    }

    /// Wait until the connection is closed.
    pub async fn wait_closed(&self) {
        self.inner.closed().await
    }

    /// Whether nothing is queued for sending and no request awaits a response.
    pub fn is_send_queue_empty(&self) -> bool {
        let shared = self.inner.shared();
        shared.is_idle()
    }

    /// The message IDs of the requests awaiting a terminal response.
    pub fn pending_message_ids(&self) -> Vec<u16> {
        let mut ids: Vec<_> = self.inner.shared().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// The responses to one request.
#[derive(Debug)]
pub struct ResponseReceiver {
    message_id: u16,
    rx: mpsc::UnboundedReceiver<DicomResponse>,
}

impl ResponseReceiver {
    /// The message ID of the request.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// The next response,
    /// or `None` after the terminal one or when the association ended.
    pub async fn next(&mut self) -> Option<DicomResponse> {
        self.rx.recv().await
    }

    /// The last response, normally the terminal one.
    pub async fn last(mut self) -> Option<DicomResponse> {
        let mut last = None;
        while let Some(response) = self.next().await {
            last = Some(response);
        }
        last
    }

    /// All the responses.
    pub async fn collect(mut self) -> Vec<DicomResponse> {
        let mut responses = Vec::new();
        while let Some(response) = self.next().await {
            responses.push(response);
        }
        responses
    }
}

/// Receiver of association-level events.
pub(crate) enum Events {
    Provider(Arc<dyn ServiceProvider>),
    User(Arc<dyn ServiceUser>),
}

impl Events {
    fn on_abort(&self, source: &AbortRQSource) {
        match self {
            Events::Provider(provider) => provider.on_abort(source),
            Events::User(user) => user.on_abort(source),
        }
    }

    fn on_connection_closed(&self, error: Option<&Error>) {
        match self {
            Events::Provider(provider) => provider.on_connection_closed(error),
            Events::User(user) => user.on_connection_closed(error),
        }
    }
}

pub(crate) enum Outgoing {
    Request {
        request: DicomRequest,
        sender: mpsc::UnboundedSender<DicomResponse>,
    },
    Response(DicomResponse),
}

/// A request sent and not yet answered with a terminal status.
pub(crate) struct PendingRequest {
    field: CommandField,
    presentation_context_id: u8,
    sender: mpsc::UnboundedSender<DicomResponse>,
}

/// Connection bookkeeping, behind a single lock
/// which is never held across an await point.
pub(crate) struct Shared {
    association: Option<Arc<Association>>,
    /// the association proposed by this node, until answered
    proposed: Option<Association>,
    next_message_id: u16,
    queue: VecDeque<Outgoing>,
    pending: HashMap<u16, PendingRequest>,
    /// whether the scheduler is transmitting a message
    sending: bool,
    empty_notified: bool,
    closing: bool,
    /// the A-ABORT for the writer to send instead of whatever is still queued
    abort: Option<AbortRQSource>,
    close_error: Option<Error>,
}

impl Shared {
    fn next_message_id(&mut self) -> u16 {
        loop {
            let id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1);
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pending.is_empty() && !self.sending
    }
}

pub(crate) struct Inner {
    options: ServiceOptions,
    capabilities: Capabilities,
    storage: Arc<dyn StoreStorage>,
    transcoder: Arc<dyn Transcoder>,
    events: Events,
    span: Span,
    shared: Mutex<Shared>,
    state: watch::Sender<AssociationState>,
    /// whether the send queue and the pending set are both empty
    idle: watch::Sender<bool>,
    outgoing: mpsc::Sender<Pdu>,
    wake_sender: Notify,
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> AssociationState {
        *self.state.borrow()
    }

    fn set_state(&self, state: AssociationState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Association state: {} -> {}", previous, state);
        }
    }

    fn is_closed(&self) -> bool {
        self.state() == AssociationState::Closed
    }

    fn refresh_idle(&self, shared: &Shared) {
        self.idle.send_replace(shared.is_idle());
    }

    fn take_close_error(&self) -> Option<Error> {
        self.shared().close_error.take()
    }

    /// Resolves once the association is closed.
    async fn closed(&self) {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current == AssociationState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Put a PDU in the writer's queue,
    /// waiting for room unless the connection closes first.
    ///
    /// Returns whether the PDU was queued.
    async fn send_pdu(&self, pdu: Pdu) -> bool {
        if self.is_closed() {
            return false;
        }
        tokio::select! {
            sent = self.outgoing.send(pdu) => sent.is_ok(),
            _ = self.closed() => false,
        }
    }

    /// Leave an A-ABORT for the writer, to go out ahead of the send queue.
    /// The caller closes the connection next.
    ///
    /// Returns `false` if the connection is already closing.
    fn request_abort(&self, source: AbortRQSource) -> bool {
        let mut shared = self.shared();
        if shared.closing {
            return false;
        }
        warn!("Aborting association: {}", source);
        shared.abort = Some(source);
        true
    }

    fn is_aborting(&self) -> bool {
        self.shared().abort.is_some()
    }

    /// Queue a response for sending.
    ///
    /// Responses produced after the association closed are discarded.
    fn enqueue_response(&self, response: DicomResponse) {
        {
            let mut shared = self.shared();
            if shared.closing {
                info!("Discarding {} on closed association", response);
                return;
            }
            shared.queue.push_back(Outgoing::Response(response));
            shared.empty_notified = false;
            self.refresh_idle(&shared);
        }
        self.wake_sender.notify_one();
    }

    /// Close the connection, ending every outstanding request.
    ///
    /// Only the first call has an effect.
    fn close(&self, error: Option<Error>) {
        let (pending, queue) = {
            let mut shared = self.shared();
            if shared.closing {
                return;
            }
            shared.closing = true;
            shared.sending = false;
            (
                std::mem::take(&mut shared.pending),
                std::mem::take(&mut shared.queue),
            )
        };
        if !pending.is_empty() {
            warn!("{} requests left without a final response", pending.len());
        }
        drop(pending);
        drop(queue);

        match &error {
            Some(error) => warn!("Connection closed: {}", snafu::Report::from_error(error)),
            None => info!("Connection closed"),
        }
        self.events.on_connection_closed(error.as_ref());
        if let Some(error) = error {
            self.shared().close_error = Some(error);
        }
        self.set_state(AssociationState::Closed);
        self.idle.send_replace(true);
        self.wake_sender.notify_one();
    }
}
