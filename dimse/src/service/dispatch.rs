//! Handing incoming requests over to the application's providers.
use std::sync::Arc;

use tracing::{error, warn, Instrument};

use super::*;
use crate::storage::{StoreMeta, StoreSink};

impl Inner {
    /// Run the provider for a request on the blocking thread pool
    /// and queue its responses.
    pub(super) fn dispatch(self: &Arc<Self>, request: DicomRequest) {
        let capabilities = self.capabilities.clone();
        self.spawn_handler(request, move |mut request| {
            handle_request(&capabilities, &mut request)
        });
    }

    /// Finish storing a received instance,
    /// then run the C-STORE provider on it.
    pub(super) fn dispatch_store(
        self: &Arc<Self>,
        request: DicomRequest,
        meta: StoreMeta,
        sink: Result<Box<dyn StoreSink>, storage::Error>,
    ) {
        let capabilities = self.capabilities.clone();
        self.spawn_handler(request, move |mut request| {
            let Some(provider) = capabilities.c_store.as_ref() else {
                return not_implemented(&request);
            };
            let instance = sink.and_then(|sink| sink.finish(meta.clone()));
            match instance {
                Ok(instance) => {
                    request.set_received_instance(instance);
                    vec![provider.on_c_store_request(&mut request)]
                }
                Err(source) => {
                    provider.on_c_store_request_exception(&meta, &source);
                    let comment = source.to_string();
                    let error = Error::Storage { source };
                    error!(
                        "Could not receive instance {} of {}: {}",
                        meta.sop_instance_uid,
                        request,
                        snafu::Report::from_error(&error)
                    );
                    vec![DicomResponse::new(&request, Status::PROCESSING_FAILURE)
                        .with_error_comment(comment)]
                }
            }
        });
    }

    fn spawn_handler<F>(self: &Arc<Self>, request: DicomRequest, handler: F)
    where
        F: FnOnce(DicomRequest) -> Vec<DicomResponse> + Send + 'static,
    {
        let inner = Arc::clone(self);
        let span = self.span.clone();
        let field = request.field();
        let presentation_context_id = request.message().presentation_context_id();
        // answers the request if the handler panics
        let fallback = (field != CommandField::CCancelRq).then(|| {
            DicomResponse::new(&request, Status::PROCESSING_FAILURE)
                .with_error_comment("request handler panicked")
        });
        let description = request.to_string();

        let handler_span = span.clone();
        let task = async move {
            let outcome = tokio::task::spawn_blocking(move || {
                let _entered = handler_span.enter();
                handler(request)
            })
            .await;
            let responses = match outcome {
                Ok(responses) => responses,
                Err(e) => {
                    error!("Handler for {} failed: {}", description, e);
                    fallback.into_iter().collect()
                }
            };
            for mut response in responses {
                if response.message().presentation_context_id().is_none() {
                    if let Some(id) = presentation_context_id {
                        response.message_mut().set_presentation_context_id(id);
                    }
                }
                inner.enqueue_response(response);
            }
        };
        tokio::spawn(task.instrument(span));
    }
}

fn not_implemented(request: &DicomRequest) -> Vec<DicomResponse> {
    let error = ServiceNotImplementedSnafu {
        field: request.field(),
    }
    .build();
    warn!("Refusing {}: {}", request, error);
    vec![DicomResponse::new(request, Status::UNRECOGNIZED_OPERATION)]
}

fn handle_request(capabilities: &Capabilities, request: &mut DicomRequest) -> Vec<DicomResponse> {
    let responses = match request.field() {
        CommandField::CEchoRq => capabilities
            .c_echo
            .as_ref()
            .map(|p| vec![p.on_c_echo_request(request)]),
        CommandField::CStoreRq => capabilities
            .c_store
            .as_ref()
            .map(|p| vec![p.on_c_store_request(request)]),
        CommandField::CFindRq => capabilities
            .c_find
            .as_ref()
            .map(|p| p.on_c_find_request(request)),
        CommandField::CGetRq => capabilities
            .c_get
            .as_ref()
            .map(|p| p.on_c_get_request(request)),
        CommandField::CMoveRq => capabilities
            .c_move
            .as_ref()
            .map(|p| p.on_c_move_request(request)),
        // C-CANCEL has no response, not even a refusal
        CommandField::CCancelRq => {
            match capabilities.c_cancel.as_ref() {
                Some(p) => p.on_c_cancel_request(request),
                None => warn!(
                    "Ignoring {}: {}",
                    request,
                    ServiceNotImplementedSnafu {
                        field: request.field()
                    }
                    .build()
                ),
            }
            Some(Vec::new())
        }
        CommandField::NCreateRq => capabilities
            .n_service
            .as_ref()
            .map(|p| vec![p.on_n_create_request(request)]),
        CommandField::NSetRq => capabilities
            .n_service
            .as_ref()
            .map(|p| vec![p.on_n_set_request(request)]),
        CommandField::NGetRq => capabilities
            .n_service
            .as_ref()
            .map(|p| vec![p.on_n_get_request(request)]),
        CommandField::NDeleteRq => capabilities
            .n_service
            .as_ref()
            .map(|p| vec![p.on_n_delete_request(request)]),
        CommandField::NActionRq => capabilities
            .n_service
            .as_ref()
            .map(|p| vec![p.on_n_action_request(request)]),
        CommandField::NEventReportRq => capabilities
            .n_service
            .as_ref()
            .map(|p| vec![p.on_n_event_report_request(request)]),
        field => {
            warn!("Not a request: {}", field);
            Some(Vec::new())
        }
    };
    responses.unwrap_or_else(|| not_implemented(request))
}
