pub mod signatures;
pub mod token;

pub use signatures::SignatureManager;
pub use token::{CaKeyRing, SigningCapability, SigningCertificate, TokenReference};
