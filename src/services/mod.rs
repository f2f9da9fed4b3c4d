// External collaborators consumed by the engine: the outbound message
// channel and the tenant/contact directory.

pub mod channel;
pub mod directory;

pub use channel::{HttpMessageChannel, MessageChannel, MessageReceipt};
pub use directory::{ContactDirectory, ContactMutation, ContactSnapshot, PgContactDirectory};
