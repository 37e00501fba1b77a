//! Service callback boundary.
//!
//! Application logic plugs into the connection engine through the
//! capability traits of this module, one per DIMSE service.
//! A [`Capabilities`] set lists which of them a service implements,
//! and is resolved once when the engine is built:
//! a request for a capability that is absent is answered with
//! [`Status::UNRECOGNIZED_OPERATION`] on behalf of the application.
//!
//! Association-level events are delivered through [`ServiceProvider`]
//! (accepting side) and [`ServiceUser`] (requesting side).
//!
//! Callbacks run on the blocking thread pool of the runtime,
//! so they are free to perform synchronous work.
use std::fmt;
use std::sync::Arc;

use crate::association::Association;
use crate::message::{DicomRequest, DicomResponse, Status};
use crate::pdu::{AbortRQSource, AssociationRJ};
use crate::storage::{self, StoreMeta};

/// C-ECHO service class provider.
pub trait CEchoProvider: Send + Sync {
    fn on_c_echo_request(&self, request: &DicomRequest) -> DicomResponse;
}

/// C-STORE service class provider.
pub trait CStoreProvider: Send + Sync {
    /// Handle a received instance,
    /// available through [`DicomRequest::received_instance`].
    fn on_c_store_request(&self, request: &mut DicomRequest) -> DicomResponse;

    /// Called when an incoming instance could not be stored or parsed.
    ///
    /// A response with [`Status::PROCESSING_FAILURE`] is sent to the peer
    /// regardless of what this method does.
    fn on_c_store_request_exception(&self, meta: &StoreMeta, error: &storage::Error) {
        let _ = (meta, error);
    }
}

/// C-FIND service class provider.
///
/// Each match is returned as a pending response,
/// followed by a final response with a terminal status.
pub trait CFindProvider: Send + Sync {
    fn on_c_find_request(&self, request: &DicomRequest) -> Vec<DicomResponse>;
}

/// C-GET service class provider.
pub trait CGetProvider: Send + Sync {
    fn on_c_get_request(&self, request: &DicomRequest) -> Vec<DicomResponse>;
}

/// C-MOVE service class provider.
pub trait CMoveProvider: Send + Sync {
    fn on_c_move_request(&self, request: &DicomRequest) -> Vec<DicomResponse>;
}

/// Receiver of C-CANCEL requests.
///
/// The request's [`cancelled_message_id`](DicomRequest::cancelled_message_id)
/// names the operation to stop. No response is sent for a cancel request.
pub trait CCancelProvider: Send + Sync {
    fn on_c_cancel_request(&self, request: &DicomRequest);
}

/// Provider of the normalized (N-*) services.
///
/// Every operation defaults to [`Status::UNRECOGNIZED_OPERATION`].
pub trait NServiceProvider: Send + Sync {
    fn on_n_create_request(&self, request: &DicomRequest) -> DicomResponse {
        DicomResponse::new(request, Status::UNRECOGNIZED_OPERATION)
    }

    fn on_n_set_request(&self, request: &DicomRequest) -> DicomResponse {
        DicomResponse::new(request, Status::UNRECOGNIZED_OPERATION)
    }

    fn on_n_get_request(&self, request: &DicomRequest) -> DicomResponse {
        DicomResponse::new(request, Status::UNRECOGNIZED_OPERATION)
    }

    fn on_n_delete_request(&self, request: &DicomRequest) -> DicomResponse {
        DicomResponse::new(request, Status::UNRECOGNIZED_OPERATION)
    }

    fn on_n_action_request(&self, request: &DicomRequest) -> DicomResponse {
        DicomResponse::new(request, Status::UNRECOGNIZED_OPERATION)
    }

    fn on_n_event_report_request(&self, request: &DicomRequest) -> DicomResponse {
        DicomResponse::new(request, Status::UNRECOGNIZED_OPERATION)
    }
}

/// Answers every C-ECHO request with success.
#[derive(Debug, Default, Copy, Clone)]
pub struct VerificationProvider;

impl CEchoProvider for VerificationProvider {
    fn on_c_echo_request(&self, request: &DicomRequest) -> DicomResponse {
        DicomResponse::new(request, Status::SUCCESS)
    }
}

/// The set of DIMSE services implemented by an application.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub c_echo: Option<Arc<dyn CEchoProvider>>,
    pub c_store: Option<Arc<dyn CStoreProvider>>,
    pub c_find: Option<Arc<dyn CFindProvider>>,
    pub c_get: Option<Arc<dyn CGetProvider>>,
    pub c_move: Option<Arc<dyn CMoveProvider>>,
    pub c_cancel: Option<Arc<dyn CCancelProvider>>,
    pub n_service: Option<Arc<dyn NServiceProvider>>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("c_echo", &self.c_echo.is_some())
            .field("c_store", &self.c_store.is_some())
            .field("c_find", &self.c_find.is_some())
            .field("c_get", &self.c_get.is_some())
            .field("c_move", &self.c_move.is_some())
            .field("c_cancel", &self.c_cancel.is_some())
            .field("n_service", &self.n_service.is_some())
            .finish()
    }
}

impl Capabilities {
    /// No services at all.
    pub fn new() -> Self {
        Capabilities::default()
    }

    /// Only the verification service.
    pub fn verification() -> Self {
        Capabilities::new().with_c_echo(VerificationProvider)
    }

    pub fn with_c_echo(mut self, provider: impl CEchoProvider + 'static) -> Self {
        self.c_echo = Some(Arc::new(provider));
        self
    }

    pub fn with_c_store(mut self, provider: impl CStoreProvider + 'static) -> Self {
        self.c_store = Some(Arc::new(provider));
        self
    }

    pub fn with_c_find(mut self, provider: impl CFindProvider + 'static) -> Self {
        self.c_find = Some(Arc::new(provider));
        self
    }

    pub fn with_c_get(mut self, provider: impl CGetProvider + 'static) -> Self {
        self.c_get = Some(Arc::new(provider));
        self
    }

    pub fn with_c_move(mut self, provider: impl CMoveProvider + 'static) -> Self {
        self.c_move = Some(Arc::new(provider));
        self
    }

    pub fn with_c_cancel(mut self, provider: impl CCancelProvider + 'static) -> Self {
        self.c_cancel = Some(Arc::new(provider));
        self
    }

    pub fn with_n_service(mut self, provider: impl NServiceProvider + 'static) -> Self {
        self.n_service = Some(Arc::new(provider));
        self
    }
}

/// Association events on the accepting side.
pub trait ServiceProvider: Send + Sync {
    /// Decide on an incoming association request.
    ///
    /// Every presentation context should be accepted or rejected;
    /// those left untouched are rejected with `NoReason`.
    /// Returning an error rejects the whole association.
    fn on_association_request(&self, association: &mut Association) -> Result<(), AssociationRJ>;

    /// The peer asked to release the association.
    /// The release response is sent right after.
    fn on_release_request(&self) {}

    /// The peer aborted the association.
    fn on_abort(&self, source: &AbortRQSource) {
        let _ = source;
    }

    /// The connection was closed, with the error which caused it, if any.
    fn on_connection_closed(&self, error: Option<&crate::service::Error>) {
        let _ = error;
    }
}

/// Association events on the requesting side.
///
/// All methods do nothing by default.
pub trait ServiceUser: Send + Sync {
    fn on_association_accept(&self, association: &Association) {
        let _ = association;
    }

    fn on_association_reject(&self, rejection: &AssociationRJ) {
        let _ = rejection;
    }

    fn on_release_response(&self) {}

    fn on_abort(&self, source: &AbortRQSource) {
        let _ = source;
    }

    fn on_connection_closed(&self, error: Option<&crate::service::Error>) {
        let _ = error;
    }

    /// No message is waiting to be sent and no request awaits a response.
    fn on_send_queue_empty(&self) {}
}

impl ServiceUser for () {}

impl<T> ServiceProvider for Arc<T>
where
    T: ServiceProvider + ?Sized,
{
    fn on_association_request(&self, association: &mut Association) -> Result<(), AssociationRJ> {
        (**self).on_association_request(association)
    }

    fn on_release_request(&self) {
        (**self).on_release_request()
    }

    fn on_abort(&self, source: &AbortRQSource) {
        (**self).on_abort(source)
    }

    fn on_connection_closed(&self, error: Option<&crate::service::Error>) {
        (**self).on_connection_closed(error)
    }
}

impl<T> ServiceUser for Arc<T>
where
    T: ServiceUser + ?Sized,
{
    fn on_association_accept(&self, association: &Association) {
        (**self).on_association_accept(association)
    }

    fn on_association_reject(&self, rejection: &AssociationRJ) {
        (**self).on_association_reject(rejection)
    }

    fn on_release_response(&self) {
        (**self).on_release_response()
    }

    fn on_abort(&self, source: &AbortRQSource) {
        (**self).on_abort(source)
    }

    fn on_connection_closed(&self, error: Option<&crate::service::Error>) {
        (**self).on_connection_closed(error)
    }

    fn on_send_queue_empty(&self) {
        (**self).on_send_queue_empty()
    }
}
