//! Vendor protocol engines

pub mod jabra;
pub mod poly;
pub mod sennheiser;
pub mod yealink;

pub use jabra::JabraHeadset;
pub use poly::PolyHeadset;
pub use sennheiser::SennheiserHeadset;
pub use yealink::YealinkHeadset;
