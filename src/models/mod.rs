pub mod enums;
pub mod extraction;
pub mod lesion;

pub use enums::*;
pub use extraction::*;
pub use lesion::*;
