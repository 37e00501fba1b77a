//! Association acceptor policy
//!
//! This module decides how an incoming association request is answered:
//! whether the requesting node is let in at all,
//! and which presentation contexts are accepted
//! with which transfer syntax.
//! See [`AcceptorPolicy`].
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::debug;

use crate::association::uid::trim_uid;
use crate::association::Association;
use crate::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceUserReason, AssociationRJSource, PresentationContextResultReason,
    UserIdentity, APPLICATION_CONTEXT_NAME,
};
use crate::provider::ServiceProvider;

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns Ok(()) if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// that match the called AE title with the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// The negotiation policy of an accepting node,
/// often taking the role of a service class provider (SCP).
///
/// By default, all transfer syntaxes
/// supported by the main [transfer syntax registry][1] are accepted,
/// unless one or more transfer syntaxes are explicitly indicated
/// through calls to [`with_transfer_syntax`][2],
/// in which case their order of declaration is the order of preference.
///
/// - By default, the policy accepts requests from anyone
///   ([`AcceptAny`])
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`](Self::accept_called_ae_title)
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// The policy is itself a [`ServiceProvider`],
/// so it can be handed to a provider service directly
/// when no other association-level events are of interest.
///
/// [1]: dicom_transfer_syntax_registry
/// [2]: AcceptorPolicy::with_transfer_syntax
///
/// ```
/// # use dicom_dimse::association::AcceptorPolicy;
/// let policy = AcceptorPolicy::new()
///     .ae_title("STORE-SCP")
///     .accept_called_ae_title()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .with_transfer_syntax("1.2.840.10008.1.2.1")
///     .with_transfer_syntax("1.2.840.10008.1.2");
/// # let _ = policy;
/// ```
#[derive(Debug, Clone)]
pub struct AcceptorPolicy<A = AcceptAny> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: String,
    /// the expected application context name
    application_context_name: String,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<String>,
    /// the list of supported transfer syntaxes, by order of preference
    transfer_syntax_uids: Vec<String>,
    /// the expected protocol version
    protocol_version: u16,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
}

impl Default for AcceptorPolicy<AcceptAny> {
    fn default() -> Self {
        AcceptorPolicy {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            promiscuous: false,
        }
    }
}

impl AcceptorPolicy<AcceptAny> {
    /// Create a new acceptor policy with default settings.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A> AcceptorPolicy<A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the policy is first created.
    pub fn accept_any(self) -> AcceptorPolicy<AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> AcceptorPolicy<AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> AcceptorPolicy<P>
    where
        P: AccessControl,
    {
        let AcceptorPolicy {
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            promiscuous,
            ae_access_control: _,
        } = self;

        AcceptorPolicy {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            promiscuous,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title(mut self, ae_title: impl Into<String>) -> Self {
        self.ae_title = ae_title.into().trim().to_string();
        self
    }

    /// Override the expected application context name.
    pub fn application_context_name(mut self, name: impl Into<String>) -> Self {
        self.application_context_name = trim_uid(name.into());
        self
    }

    /// Include this abstract syntax in the list of supported ones.
    pub fn with_abstract_syntax(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax in the list of supported ones,
    /// after those already declared.
    pub fn with_transfer_syntax(mut self, transfer_syntax_uid: impl Into<String>) -> Self {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the expected protocol version.
    pub fn protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// The AE title of this node.
    pub fn this_ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Decide on an association request.
    ///
    /// On success, every presentation context of the association
    /// has been accepted or rejected.
    /// Otherwise, the rejection to send back is returned.
    pub fn negotiate(&self, association: &mut Association) -> Result<(), AssociationRJ> {
        let reject = |source| AssociationRJ {
            result: AssociationRJResult::Permanent,
            source,
        };

        if association.protocol_version() & self.protocol_version == 0 {
            return Err(reject(AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            )));
        }

        if association.application_context_name() != self.application_context_name {
            return Err(reject(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )));
        }

        self.ae_access_control
            .check_access(
                &self.ae_title,
                association.calling_ae_title(),
                association.called_ae_title(),
                association.user_identity(),
            )
            .map_err(|reason| reject(AssociationRJSource::ServiceUser(reason)))?;

        let contexts = association.presentation_contexts_mut().map_err(|_| {
            reject(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            ))
        })?;

        for pc in contexts.iter_mut().filter(|pc| pc.result().is_none()) {
            let outcome = if !self.promiscuous
                && !self
                    .abstract_syntax_uids
                    .iter()
                    .any(|uid| uid == pc.abstract_syntax())
            {
                pc.reject(PresentationContextResultReason::AbstractSyntaxNotSupported)
            } else {
                match self.choose_ts(pc.transfer_syntaxes()) {
                    Some(ts) => {
                        let ts = ts.clone();
                        pc.accept(&ts)
                    }
                    None => pc.reject(PresentationContextResultReason::TransferSyntaxesNotSupported),
                }
            };
            // contexts are only touched while still proposed
            if let Err(e) = outcome {
                debug!("Presentation context {} left as is: {}", pc.id(), e);
            }
        }

        Ok(())
    }

    /// From a sequence of proposed transfer syntaxes,
    /// choose the first transfer syntax to
    /// - be on the policy's list of transfer syntaxes (by its order), and
    /// - be supported by the main transfer syntax registry.
    ///
    /// If the policy's list is empty,
    /// accept the first proposed transfer syntax supported.
    fn choose_ts<'t>(&self, proposed: &'t [String]) -> Option<&'t String> {
        if self.transfer_syntax_uids.is_empty() {
            return choose_supported(proposed);
        }

        self.transfer_syntax_uids.iter().find_map(|preferred| {
            proposed
                .iter()
                .find(|ts| *ts == preferred && is_supported(ts))
        })
    }
}

impl<A> ServiceProvider for AcceptorPolicy<A>
where
    A: AccessControl + Send + Sync,
{
    fn on_association_request(&self, association: &mut Association) -> Result<(), AssociationRJ> {
        self.negotiate(association)
    }
}

/// Check that a transfer syntax repository
/// supports the given transfer syntax,
/// meaning that it can parse and decode DICOM data sets.
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry
/// supports the given transfer syntax.
///
/// ```
/// # use dicom_dimse::association::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first transfer syntax to be supported
/// by the main transfer syntax registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}
