mod auth;
mod blob;
mod remote;
mod view;

pub mod memory;

pub use self::auth::{AuthGate, Principal};
pub use self::blob::BlobStore;
pub use self::remote::{RemoteFeed, RemoteWriter, Subscription};
pub use self::view::TableView;
