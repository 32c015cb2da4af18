pub mod assertion;
mod authenticator;
pub mod credentials;
mod error;
pub mod metadata;
pub mod request;
pub mod session_store;
pub mod validate;
pub mod xmldsig;

pub use assertion::{Assertion, AttributeBag};
pub use authenticator::SamlAuthenticator;
pub use credentials::{CredentialError, ServiceProviderIdentity};
pub use error::AuthError;
pub use metadata::{FetchError, IdpMetadata, MetadataResolver};
pub use request::{IssuedRequest, PendingRequest};
pub use session_store::{
    MemorySessionStore, Session, SessionError, SessionStore, SharedSessionStore,
};
pub use validate::{ResponseValidator, ValidationError};
