//! Association model
//!
//! An [`Association`] holds the parameters negotiated
//! between two application entities:
//! AE titles, presentation contexts,
//! maximum PDU lengths and the asynchronous operations window.
//! It is built either from scratch by the requesting side
//! ([`Association::new`])
//! or from an incoming A-ASSOCIATE-RQ by the accepting side
//! ([`Association::from_request`]),
//! and becomes immutable once negotiated.
//!
//! The acceptor side policy for choosing what to accept
//! lives in the [`negotiation`] module.
pub mod negotiation;
pub(crate) mod uid;

use std::fmt;

use snafu::{ensure, Backtrace, OptionExt, Snafu};
use tracing::warn;

use crate::pdu::{
    AssociationAC, AssociationRQ, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserIdentity, UserVariableItem, APPLICATION_CONTEXT_NAME,
    DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

pub use negotiation::{
    choose_supported, is_supported, AcceptAny, AcceptCalledAeTitle, AcceptorPolicy,
    AccessControl,
};

/// The transfer syntax UID written in results of rejected contexts,
/// where the field is not significant.
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid AE title `{}`: {}", ae_title, reason))]
    InvalidAeTitle {
        ae_title: String,
        reason: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid presentation context ID {} (must be odd)", id))]
    InvalidPresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("Duplicate presentation context ID {}", id))]
    DuplicatePresentationContextId { id: u8, backtrace: Backtrace },

    #[snafu(display("No more presentation context IDs available"))]
    PresentationContextIdsExhausted { backtrace: Backtrace },

    #[snafu(display("Result of presentation context {} was already set", id))]
    ResultAlreadySet { id: u8, backtrace: Backtrace },

    #[snafu(display(
        "Transfer syntax {} was not proposed for presentation context {}",
        transfer_syntax,
        id
    ))]
    TransferSyntaxNotProposed {
        id: u8,
        transfer_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Unknown presentation context {}", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    #[snafu(display("Cannot reject a presentation context with `acceptance`"))]
    InvalidRejectionReason { backtrace: Backtrace },

    #[snafu(display("Association parameters were already negotiated"))]
    AlreadyNegotiated { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The state of an association,
/// as seen by one of the two application entities.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// nothing was exchanged yet
    Idle,
    /// A-ASSOCIATE-RQ sent, waiting for the acceptor's answer
    RequestSent,
    /// A-ASSOCIATE-RQ received, negotiation in progress
    RequestReceived,
    /// association accepted, DIMSE messages can flow
    Established,
    /// A-RELEASE-RQ sent, waiting for A-RELEASE-RP
    Releasing,
    /// the association is over
    Closed,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssociationState::Idle => "idle",
            AssociationState::RequestSent => "request sent",
            AssociationState::RequestReceived => "request received",
            AssociationState::Established => "established",
            AssociationState::Releasing => "releasing",
            AssociationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Check that the given text is a valid application entity title:
/// not blank, at most 16 characters,
/// no control characters and no backslash.
pub fn validate_ae_title(ae_title: &str) -> Result<()> {
    let fail = |reason: &'static str| -> Result<()> {
        InvalidAeTitleSnafu {
            ae_title: ae_title.to_string(),
            reason,
        }
        .fail()
    };
    if ae_title.trim().is_empty() {
        return fail("AE title is blank");
    }
    if ae_title.len() > 16 {
        return fail("AE title is longer than 16 characters");
    }
    if !ae_title.is_ascii() {
        return fail("AE title contains non-ASCII characters");
    }
    if ae_title.chars().any(|c| c.is_ascii_control() || c == '\\') {
        return fail("AE title contains control characters or backslash");
    }
    Ok(())
}

/// A presentation context of an association,
/// proposed by the requestor and eventually settled by the acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    id: u8,
    abstract_syntax: String,
    /// proposed transfer syntaxes,
    /// reduced to the single accepted one on acceptance
    transfer_syntaxes: Vec<String>,
    /// `None` while still proposed
    result: Option<PresentationContextResultReason>,
}

impl PresentationContext {
    /// Create a new proposed presentation context.
    ///
    /// The ID must be an odd number.
    pub fn new<A, I, T>(id: u8, abstract_syntax: A, transfer_syntaxes: I) -> Result<Self>
    where
        A: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        ensure!(id % 2 == 1, InvalidPresentationContextIdSnafu { id });
        Ok(PresentationContext {
            id,
            abstract_syntax: uid::trim_uid(abstract_syntax.into()),
            transfer_syntaxes: transfer_syntaxes
                .into_iter()
                .map(|ts| uid::trim_uid(ts.into()))
                .collect(),
            result: None,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn abstract_syntax(&self) -> &str {
        &self.abstract_syntax
    }

    /// The transfer syntaxes of this context:
    /// all proposed ones before negotiation,
    /// exactly the accepted one after acceptance.
    pub fn transfer_syntaxes(&self) -> &[String] {
        &self.transfer_syntaxes
    }

    /// The negotiation result, `None` if still proposed.
    pub fn result(&self) -> Option<PresentationContextResultReason> {
        self.result
    }

    pub fn is_accepted(&self) -> bool {
        self.result == Some(PresentationContextResultReason::Acceptance)
    }

    /// The accepted transfer syntax, if the context was accepted.
    pub fn accepted_transfer_syntax(&self) -> Option<&str> {
        if self.is_accepted() {
            self.transfer_syntaxes.first().map(String::as_str)
        } else {
            None
        }
    }

    /// Accept the context with one of the proposed transfer syntaxes.
    pub fn accept(&mut self, transfer_syntax: &str) -> Result<()> {
        ensure!(self.result.is_none(), ResultAlreadySetSnafu { id: self.id });
        let transfer_syntax = uid::trim_uid(transfer_syntax.to_string());
        ensure!(
            self.transfer_syntaxes.contains(&transfer_syntax),
            TransferSyntaxNotProposedSnafu {
                id: self.id,
                transfer_syntax,
            }
        );
        self.transfer_syntaxes = vec![transfer_syntax];
        self.result = Some(PresentationContextResultReason::Acceptance);
        Ok(())
    }

    /// Accept the context with the first transfer syntax in `preferred`
    /// which was also proposed.
    ///
    /// When none of them was proposed,
    /// the context is rejected with `TransferSyntaxesNotSupported`.
    /// Returns whether the context was accepted.
    pub fn accept_preferred<I, T>(&mut self, preferred: I) -> Result<bool>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let chosen = preferred.into_iter().find_map(|ts| {
            self.transfer_syntaxes
                .iter()
                .find(|proposed| proposed.as_str() == ts.as_ref())
                .cloned()
        });
        match chosen {
            Some(ts) => {
                self.accept(&ts)?;
                Ok(true)
            }
            None => {
                self.reject(PresentationContextResultReason::TransferSyntaxesNotSupported)?;
                Ok(false)
            }
        }
    }

    /// Reject the context with the given reason.
    pub fn reject(&mut self, reason: PresentationContextResultReason) -> Result<()> {
        ensure!(
            reason != PresentationContextResultReason::Acceptance,
            InvalidRejectionReasonSnafu
        );
        ensure!(self.result.is_none(), ResultAlreadySetSnafu { id: self.id });
        self.result = Some(reason);
        Ok(())
    }

    /// Settle the context as the peer acceptor declared it.
    fn settle_from_peer(&mut self, result: &PresentationContextResult) {
        if result.reason == PresentationContextResultReason::Acceptance {
            let ts = uid::trim_uid(result.transfer_syntax.clone());
            if !self.transfer_syntaxes.contains(&ts) {
                warn!(
                    "Peer accepted presentation context {} with transfer syntax {} which was not proposed",
                    self.id, ts
                );
            }
            self.transfer_syntaxes = vec![ts];
        }
        self.result = Some(result.reason);
    }

    /// The proposed form of this context, for an A-ASSOCIATE-RQ.
    pub fn to_proposed(&self) -> PresentationContextProposed {
        PresentationContextProposed {
            id: self.id,
            abstract_syntax: self.abstract_syntax.clone(),
            transfer_syntaxes: self.transfer_syntaxes.clone(),
        }
    }

    /// The result form of this context, for an A-ASSOCIATE-AC.
    ///
    /// A context which is still proposed is reported as rejected
    /// with `NoReason`.
    pub fn to_result(&self) -> PresentationContextResult {
        let reason = self
            .result
            .unwrap_or(PresentationContextResultReason::NoReason);
        let transfer_syntax = match self.accepted_transfer_syntax() {
            Some(ts) => ts.to_string(),
            None => IMPLICIT_VR_LE.to_string(),
        };
        PresentationContextResult {
            id: self.id,
            reason,
            transfer_syntax,
        }
    }
}

/// The negotiated parameters of an association.
#[derive(Debug, Clone)]
pub struct Association {
    calling_ae_title: String,
    called_ae_title: String,
    application_context_name: String,
    protocol_version: u16,
    presentation_contexts: Vec<PresentationContext>,
    /// maximum PDU length the peer accepts to receive, 0 meaning unlimited
    max_pdu_length: u32,
    /// maximum PDU length this node accepts to receive
    local_max_pdu_length: u32,
    /// (invoked, performed), seen from the requestor,
    /// `None` when no window sub-item was exchanged
    async_ops_window: Option<(u16, u16)>,
    remote_implementation_class_uid: Option<String>,
    remote_implementation_version_name: Option<String>,
    user_identity: Option<UserIdentity>,
    /// sub-items without a dedicated field (role selection, extended negotiation, ...)
    extra_user_variables: Vec<UserVariableItem>,
    negotiated: bool,
}

impl Association {
    /// Start a new association to be requested by this node.
    pub fn new(calling_ae_title: impl Into<String>, called_ae_title: impl Into<String>) -> Result<Self> {
        let calling_ae_title = calling_ae_title.into();
        let called_ae_title = called_ae_title.into();
        validate_ae_title(&calling_ae_title)?;
        validate_ae_title(&called_ae_title)?;
        Ok(Association {
            calling_ae_title: calling_ae_title.trim().to_string(),
            called_ae_title: called_ae_title.trim().to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            protocol_version: 1,
            presentation_contexts: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            local_max_pdu_length: DEFAULT_MAX_PDU,
            async_ops_window: None,
            remote_implementation_class_uid: None,
            remote_implementation_version_name: None,
            user_identity: None,
            extra_user_variables: Vec::new(),
            negotiated: false,
        })
    }

    /// Build the association proposed by an incoming A-ASSOCIATE-RQ.
    ///
    /// All presentation contexts start as proposed.
    pub fn from_request(rq: &AssociationRQ, local_max_pdu_length: u32) -> Result<Self> {
        let mut association = Association::new(&*rq.calling_ae_title, &*rq.called_ae_title)?;
        association.application_context_name = rq.application_context_name.clone();
        association.protocol_version = rq.protocol_version;
        association.local_max_pdu_length = local_max_pdu_length;

        for pc in &rq.presentation_contexts {
            association.push_context(PresentationContext::new(
                pc.id,
                &*pc.abstract_syntax,
                pc.transfer_syntaxes.iter().map(String::as_str),
            )?)?;
        }

        association.absorb_user_variables(&rq.user_variables);
        Ok(association)
    }

    fn absorb_user_variables(&mut self, user_variables: &[UserVariableItem]) {
        let mut max_pdu_length = DEFAULT_MAX_PDU;
        for item in user_variables {
            match item {
                UserVariableItem::MaxLength(len) => max_pdu_length = *len,
                UserVariableItem::ImplementationClassUID(uid) => {
                    self.remote_implementation_class_uid = Some(uid.clone());
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    self.remote_implementation_version_name = Some(name.clone());
                }
                UserVariableItem::AsyncOperationsWindow {
                    max_operations_invoked,
                    max_operations_performed,
                } => {
                    self.async_ops_window =
                        Some((*max_operations_invoked, *max_operations_performed));
                }
                UserVariableItem::UserIdentityItem(identity) => {
                    self.user_identity = Some(identity.clone());
                }
                other => self.extra_user_variables.push(other.clone()),
            }
        }
        self.max_pdu_length = max_pdu_length;
    }

    fn push_context(&mut self, pc: PresentationContext) -> Result<()> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        ensure!(
            self.presentation_contexts.iter().all(|p| p.id != pc.id),
            DuplicatePresentationContextIdSnafu { id: pc.id }
        );
        self.presentation_contexts.push(pc);
        Ok(())
    }

    /// Propose a new presentation context,
    /// assigning the next free odd ID.
    pub fn add_presentation_context<A, I, T>(
        &mut self,
        abstract_syntax: A,
        transfer_syntaxes: I,
    ) -> Result<u8>
    where
        A: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let id = (1..=255u8)
            .step_by(2)
            .find(|id| self.presentation_contexts.iter().all(|pc| pc.id != *id))
            .context(PresentationContextIdsExhaustedSnafu)?;
        self.add_presentation_context_with_id(id, abstract_syntax, transfer_syntaxes)?;
        Ok(id)
    }

    /// Propose a new presentation context with an explicit ID.
    pub fn add_presentation_context_with_id<A, I, T>(
        &mut self,
        id: u8,
        abstract_syntax: A,
        transfer_syntaxes: I,
    ) -> Result<()>
    where
        A: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.push_context(PresentationContext::new(id, abstract_syntax, transfer_syntaxes)?)
    }

    fn context_mut(&mut self, id: u8) -> Result<&mut PresentationContext> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        self.presentation_contexts
            .iter_mut()
            .find(|pc| pc.id == id)
            .context(UnknownPresentationContextSnafu { id })
    }

    /// Accept the presentation context with the given transfer syntax.
    pub fn accept_context(&mut self, id: u8, transfer_syntax: &str) -> Result<()> {
        self.context_mut(id)?.accept(transfer_syntax)
    }

    /// Reject the presentation context with the given reason.
    pub fn reject_context(&mut self, id: u8, reason: PresentationContextResultReason) -> Result<()> {
        self.context_mut(id)?.reject(reason)
    }

    /// Reject every presentation context which is still proposed,
    /// with reason `NoReason`.
    pub fn reject_unanswered(&mut self) {
        for pc in self
            .presentation_contexts
            .iter_mut()
            .filter(|pc| pc.result.is_none())
        {
            pc.result = Some(PresentationContextResultReason::NoReason);
        }
    }

    /// Produce the A-ASSOCIATE-RQ for this association.
    pub fn to_request(&self) -> AssociationRQ {
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.local_max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        ];
        if let Some((max_operations_invoked, max_operations_performed)) = self.async_ops_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked,
                max_operations_performed,
            });
        }
        user_variables.extend(self.extra_user_variables.iter().cloned());
        user_variables.push(UserVariableItem::ImplementationVersionName(
            IMPLEMENTATION_VERSION_NAME.to_string(),
        ));
        if let Some(identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(identity.clone()));
        }

        AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: self.application_context_name.clone(),
            presentation_contexts: self
                .presentation_contexts
                .iter()
                .map(PresentationContext::to_proposed)
                .collect(),
            user_variables,
        }
    }

    /// Conclude negotiation on the acceptor side
    /// and produce the A-ASSOCIATE-AC.
    ///
    /// Contexts still proposed are rejected with `NoReason`,
    /// and the association becomes immutable.
    pub fn accept(&mut self) -> AssociationAC {
        self.reject_unanswered();
        self.negotiated = true;

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.local_max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        ];
        if let Some((max_operations_invoked, max_operations_performed)) = self.async_ops_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow {
                max_operations_invoked,
                max_operations_performed,
            });
        }
        user_variables.push(UserVariableItem::ImplementationVersionName(
            IMPLEMENTATION_VERSION_NAME.to_string(),
        ));

        AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: self.application_context_name.clone(),
            presentation_contexts: self
                .presentation_contexts
                .iter()
                .map(PresentationContext::to_result)
                .collect(),
            user_variables,
        }
    }

    /// Apply the acceptor's answer on the requestor side.
    ///
    /// Contexts which the acceptor did not mention are rejected,
    /// and the association becomes immutable.
    pub fn apply_accept(&mut self, ac: &AssociationAC) -> Result<()> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        for result in &ac.presentation_contexts {
            match self
                .presentation_contexts
                .iter_mut()
                .find(|pc| pc.id == result.id)
            {
                Some(pc) if pc.result.is_none() => pc.settle_from_peer(result),
                Some(_) => warn!("Presentation context {} settled twice", result.id),
                None => warn!("Peer answered unknown presentation context {}", result.id),
            }
        }
        self.reject_unanswered();

        // from here on, the sub-items describe what the acceptor answered
        self.async_ops_window = None;
        self.extra_user_variables.clear();
        self.absorb_user_variables(&ac.user_variables);
        self.negotiated = true;
        Ok(())
    }

    /// Restrict the asynchronous operations window
    /// to what this node is willing to support,
    /// where 0 means unlimited on either side.
    ///
    /// Has no effect if the peer did not propose a window.
    pub fn limit_async_ops_window(&mut self, local_limit: u16) {
        fn lower(requested: u16, limit: u16) -> u16 {
            match (requested, limit) {
                (0, l) => l,
                (r, 0) => r,
                (r, l) => r.min(l),
            }
        }
        if let Some((invoked, performed)) = self.async_ops_window {
            self.async_ops_window = Some((lower(invoked, local_limit), lower(performed, local_limit)));
        }
    }

    /// Propose an asynchronous operations window (requestor side).
    pub fn set_async_ops_window(&mut self, invoked: u16, performed: u16) -> Result<()> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        self.async_ops_window = Some((invoked, performed));
        Ok(())
    }

    pub fn set_local_max_pdu_length(&mut self, max_pdu_length: u32) -> Result<()> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        self.local_max_pdu_length = max_pdu_length;
        Ok(())
    }

    pub fn set_user_identity(&mut self, user_identity: UserIdentity) -> Result<()> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        self.user_identity = Some(user_identity);
        Ok(())
    }

    /// Add a user information sub-item to propose,
    /// such as SCP/SCU role selection.
    pub fn add_user_variable(&mut self, item: UserVariableItem) -> Result<()> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        self.extra_user_variables.push(item);
        Ok(())
    }

    /// Find the accepted context to use for a message
    /// of the given abstract syntax.
    ///
    /// An accepted context with the preferred transfer syntax wins,
    /// otherwise the first accepted context with that abstract syntax.
    pub fn select_context(
        &self,
        abstract_syntax: &str,
        preferred_transfer_syntax: Option<&str>,
    ) -> Option<&PresentationContext> {
        let abstract_syntax = abstract_syntax.trim_end_matches(|c| c == '\0' || c == ' ');
        let mut candidates = self
            .presentation_contexts
            .iter()
            .filter(|pc| pc.is_accepted() && pc.abstract_syntax == abstract_syntax);
        match preferred_transfer_syntax {
            Some(ts) => {
                let candidates: Vec<_> = candidates.collect();
                candidates
                    .iter()
                    .find(|pc| pc.accepted_transfer_syntax() == Some(ts))
                    .or_else(|| candidates.first())
                    .copied()
            }
            None => candidates.next(),
        }
    }

    pub fn presentation_context(&self, id: u8) -> Option<&PresentationContext> {
        self.presentation_contexts.iter().find(|pc| pc.id == id)
    }

    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        &self.presentation_contexts
    }

    /// Mutable access to the presentation contexts,
    /// for acceptor policies deciding on each of them.
    pub fn presentation_contexts_mut(&mut self) -> Result<&mut [PresentationContext]> {
        ensure!(!self.negotiated, AlreadyNegotiatedSnafu);
        Ok(&mut self.presentation_contexts)
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    pub fn application_context_name(&self) -> &str {
        &self.application_context_name
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// The maximum PDU length that the peer accepts to receive,
    /// 0 meaning unlimited.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// The maximum PDU length that this node accepts to receive.
    pub fn local_max_pdu_length(&self) -> u32 {
        self.local_max_pdu_length
    }

    /// Maximum number of outstanding operations the requestor may invoke,
    /// 0 meaning unlimited.
    pub fn max_async_ops_invoked(&self) -> u16 {
        self.async_ops_window.map(|(invoked, _)| invoked).unwrap_or(1)
    }

    /// Maximum number of outstanding operations the requestor asks the acceptor
    /// to perform, which also bounds the acceptor's own requests,
    /// 0 meaning unlimited.
    pub fn max_async_ops_performed(&self) -> u16 {
        self.async_ops_window
            .map(|(_, performed)| performed)
            .unwrap_or(1)
    }

    /// The asynchronous operations window as (invoked, performed),
    /// if one was proposed or negotiated.
    pub fn async_ops_window(&self) -> Option<(u16, u16)> {
        self.async_ops_window
    }

    pub fn remote_implementation_class_uid(&self) -> Option<&str> {
        self.remote_implementation_class_uid.as_deref()
    }

    pub fn remote_implementation_version_name(&self) -> Option<&str> {
        self.remote_implementation_version_name.as_deref()
    }

    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.user_identity.as_ref()
    }

    /// User information sub-items without a dedicated accessor.
    pub fn user_variables(&self) -> &[UserVariableItem] {
        &self.extra_user_variables
    }

    /// Whether negotiation is over.
    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    #[test]
    fn ae_title_validation() {
        assert!(validate_ae_title("STORE-SCP").is_ok());
        assert!(validate_ae_title("ABCDEFGHIJKLMNOP").is_ok());
        assert_matches!(
            validate_ae_title("ABCDEFGHIJKLMNOPQ"),
            Err(Error::InvalidAeTitle { .. })
        );
        assert_matches!(validate_ae_title("   "), Err(Error::InvalidAeTitle { .. }));
        assert_matches!(validate_ae_title("A\\B"), Err(Error::InvalidAeTitle { .. }));
        assert_matches!(validate_ae_title("A\nB"), Err(Error::InvalidAeTitle { .. }));
    }

    #[test]
    fn context_ids_are_odd_and_unique() {
        let mut association = Association::new("SCU", "SCP").unwrap();
        let a = association
            .add_presentation_context(VERIFICATION, [IMPLICIT_VR_LE])
            .unwrap();
        let b = association
            .add_presentation_context(CT_IMAGE_STORAGE, [EXPLICIT_VR_LE, IMPLICIT_VR_LE])
            .unwrap();
        assert_eq!((a, b), (1, 3));

        assert_matches!(
            association.add_presentation_context_with_id(3, VERIFICATION, [IMPLICIT_VR_LE]),
            Err(Error::DuplicatePresentationContextId { id: 3, .. })
        );
        assert_matches!(
            association.add_presentation_context_with_id(4, VERIFICATION, [IMPLICIT_VR_LE]),
            Err(Error::InvalidPresentationContextId { id: 4, .. })
        );
    }

    #[test]
    fn accepted_context_has_exactly_one_transfer_syntax() {
        let mut pc =
            PresentationContext::new(1, CT_IMAGE_STORAGE, [EXPLICIT_VR_LE, IMPLICIT_VR_LE])
                .unwrap();
        assert_eq!(pc.transfer_syntaxes().len(), 2);
        pc.accept(IMPLICIT_VR_LE).unwrap();
        assert_eq!(pc.transfer_syntaxes(), &[IMPLICIT_VR_LE.to_string()]);
        assert_eq!(pc.accepted_transfer_syntax(), Some(IMPLICIT_VR_LE));

        // the result can only be set once
        assert_matches!(
            pc.accept(IMPLICIT_VR_LE),
            Err(Error::ResultAlreadySet { .. })
        );
        assert_matches!(
            pc.reject(PresentationContextResultReason::UserRejection),
            Err(Error::ResultAlreadySet { .. })
        );
        assert_eq!(pc.transfer_syntaxes().len(), 1);
    }

    #[test]
    fn accept_requires_a_proposed_transfer_syntax() {
        let mut pc = PresentationContext::new(5, VERIFICATION, [IMPLICIT_VR_LE]).unwrap();
        assert_matches!(
            pc.accept(EXPLICIT_VR_LE),
            Err(Error::TransferSyntaxNotProposed { id: 5, .. })
        );
        assert_eq!(pc.result(), None);
    }

    #[test]
    fn accept_preferred_follows_local_order() {
        let mut pc =
            PresentationContext::new(1, CT_IMAGE_STORAGE, [IMPLICIT_VR_LE, EXPLICIT_VR_LE])
                .unwrap();
        assert!(pc.accept_preferred([EXPLICIT_VR_LE, IMPLICIT_VR_LE]).unwrap());
        assert_eq!(pc.accepted_transfer_syntax(), Some(EXPLICIT_VR_LE));

        let mut pc = PresentationContext::new(3, CT_IMAGE_STORAGE, [IMPLICIT_VR_LE]).unwrap();
        assert!(!pc.accept_preferred(["1.2.840.10008.1.2.4.50"]).unwrap());
        assert_eq!(
            pc.result(),
            Some(PresentationContextResultReason::TransferSyntaxesNotSupported)
        );
    }

    #[test]
    fn accept_rejects_unanswered_contexts_and_freezes() {
        let mut association = Association::new("SCU", "SCP").unwrap();
        association
            .add_presentation_context(VERIFICATION, [IMPLICIT_VR_LE])
            .unwrap();
        association
            .add_presentation_context(CT_IMAGE_STORAGE, [IMPLICIT_VR_LE])
            .unwrap();
        association.accept_context(1, IMPLICIT_VR_LE).unwrap();

        let ac = association.accept();
        assert_eq!(ac.presentation_contexts.len(), 2);
        assert_eq!(
            ac.presentation_contexts[1].reason,
            PresentationContextResultReason::NoReason
        );
        assert!(association.is_negotiated());
        assert_matches!(
            association.add_presentation_context(VERIFICATION, [IMPLICIT_VR_LE]),
            Err(Error::AlreadyNegotiated { .. })
        );
        assert_matches!(
            association.reject_context(3, PresentationContextResultReason::UserRejection),
            Err(Error::AlreadyNegotiated { .. })
        );
    }

    #[test]
    fn request_and_accept_negotiate_async_window() {
        let mut requestor = Association::new("SCU", "SCP").unwrap();
        requestor
            .add_presentation_context(VERIFICATION, [IMPLICIT_VR_LE])
            .unwrap();
        requestor.set_async_ops_window(8, 4).unwrap();
        let rq = requestor.to_request();

        let mut acceptor = Association::from_request(&rq, 32_768).unwrap();
        assert_eq!(acceptor.max_async_ops_invoked(), 8);
        assert_eq!(acceptor.max_pdu_length(), DEFAULT_MAX_PDU);
        acceptor.limit_async_ops_window(2);
        acceptor.accept_context(1, IMPLICIT_VR_LE).unwrap();
        let ac = acceptor.accept();

        requestor.apply_accept(&ac).unwrap();
        assert_eq!(requestor.max_async_ops_invoked(), 2);
        assert_eq!(requestor.max_async_ops_performed(), 2);
        assert_eq!(requestor.max_pdu_length(), 32_768);
        assert_eq!(
            requestor.remote_implementation_class_uid(),
            Some(IMPLEMENTATION_CLASS_UID)
        );
        assert!(requestor.presentation_context(1).unwrap().is_accepted());
    }

    #[test]
    fn missing_async_window_means_one_operation() {
        let association = Association::new("SCU", "SCP").unwrap();
        assert_eq!(association.max_async_ops_invoked(), 1);
        assert_eq!(association.max_async_ops_performed(), 1);
    }

    #[test]
    fn select_context_prefers_matching_transfer_syntax() {
        let mut association = Association::new("SCU", "SCP").unwrap();
        association
            .add_presentation_context(CT_IMAGE_STORAGE, [IMPLICIT_VR_LE])
            .unwrap();
        association
            .add_presentation_context(CT_IMAGE_STORAGE, [EXPLICIT_VR_LE])
            .unwrap();
        association
            .add_presentation_context(VERIFICATION, [IMPLICIT_VR_LE])
            .unwrap();
        association.accept_context(1, IMPLICIT_VR_LE).unwrap();
        association.accept_context(3, EXPLICIT_VR_LE).unwrap();
        association.accept();

        let pc = association
            .select_context(CT_IMAGE_STORAGE, Some(EXPLICIT_VR_LE))
            .unwrap();
        assert_eq!(pc.id(), 3);
        let pc = association
            .select_context(CT_IMAGE_STORAGE, Some("1.2.840.10008.1.2.2"))
            .unwrap();
        assert_eq!(pc.id(), 1);
        // verification context was left unanswered, hence rejected
        assert!(association.select_context(VERIFICATION, None).is_none());
    }
}
