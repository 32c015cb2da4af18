mod gatekeeper;

pub use gatekeeper::{ErrorHook, SessionAttributes, require_session};
