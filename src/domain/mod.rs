//! Core value types shared by every component: the request a caller submits,
//! the session that tracks its execution, the backend capability descriptor,
//! the device profile used by the decision engine, and the decision itself.

pub mod backend;
pub mod decision;
pub mod device;
pub mod media;
pub mod request;
pub mod session;

pub use backend::BackendDescriptor;
pub use decision::Decision;
pub use device::DeviceProfile;
pub use media::MediaDescriptor;
pub use request::{Container, TranscodeRequest};
pub use session::{Session, SessionStatus};
