pub mod cbor;
pub mod document;
pub mod engagement;
pub mod error;
pub mod framing;
pub mod proximity;
pub mod request;
pub mod session;
pub mod transport;

pub use document::{
    build_device_response, oid4vp_session_transcript, selection_for_descriptor, DeviceResponse,
    ElementSelection, IssuerSigned, IssuerSignedBuilder, DEFAULT_DOC_TYPE,
};
pub use engagement::DeviceEngagement;
pub use error::*;
pub use proximity::{
    AlwaysConsent, MdocProximitySession, MdocSettings, ProximityConsent, ProximityRequest,
    ProximityState,
};
pub use request::{DeviceRequest, ItemsRequest};
pub use transport::{LoopbackTransport, ProximityTransport, ReaderLink, TransportStatus};
