//! This crate implements the DICOM upper layer protocol
//! and the DIMSE message exchange on top of it,
//! as a connection engine which drives one association per transport stream.
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and their binary encoding.
//! - The [`association`] module
//!   holds the negotiated parameters of an association,
//!   along with the acceptor side negotiation policy.
//! - The [`message`] module
//!   models DIMSE requests and responses.
//! - The [`provider`] module
//!   declares the interfaces which application logic implements
//!   to serve DIMSE requests.
//! - The [`service`] module
//!   contains the connection engine itself, [`DicomService`].
//! - The [`server`] module
//!   runs an engine for every incoming TCP connection.
//!
//! Received C-STORE data sets are streamed to a sink
//! from the [`storage`] module,
//! and outgoing data sets are converted to the negotiated transfer syntax
//! through a [`transcode::Transcoder`].

pub mod association;
pub mod message;
pub mod pdu;
pub mod provider;
pub mod server;
pub mod service;
pub mod storage;
pub mod transcode;

/// The implementation class UID of this DIMSE engine.
///
/// Generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.301958136749187424640195203615284926571";

/// The implementation version name of this DIMSE engine.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-DIMSE 0.1";

// re-exports

pub use association::{AcceptorPolicy, Association, AssociationState};
pub use message::{DicomRequest, DicomResponse, Status};
pub use pdu::Pdu;
pub use provider::{Capabilities, ServiceProvider, ServiceUser};
pub use server::DicomServer;
pub use service::{DicomService, DicomServiceBuilder, ServiceOptions};
