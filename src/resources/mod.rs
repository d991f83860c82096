pub mod common;
pub mod members;
pub mod mongo_shell;
pub mod pdb;
pub mod secret;
pub mod service;
pub mod statefulset;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
pub use members::KubeMemberBackend;
pub use mongo_shell::KubeMongoShell;
