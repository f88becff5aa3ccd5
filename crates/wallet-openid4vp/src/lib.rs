pub mod error;
pub mod flow;
pub mod handler;
pub mod jwe;
pub mod log;
pub mod request;
pub mod sdjwt;
pub mod trust;

pub use error::*;
pub use flow::{Consumed, FlowGeneration, FlowPhase, FlowState, FlowStore};
pub use handler::{AuthorizationMatch, DescriptorMatch, OpenId4VpHandler, ResponseOutcome};
pub use log::{InMemoryPresentationLog, PresentationLog, PresentationRecord};
pub use request::{AuthorizationRequest, ClientMetadata, Jwks};
pub use sdjwt::{Disclosure, SdJwt};
#[cfg(any(test, feature = "test-fixtures"))]
pub use sdjwt::SdJwtIssuer;
pub use trust::{
    check_verifier_trust, verify_request_object, HelperTlsCertificateSource, TlsCertificateSource,
    TrustPolicy, VerifiedRequestObject,
};
