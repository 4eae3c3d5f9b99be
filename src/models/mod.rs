pub mod photo;
pub mod quality;

pub use photo::*;
pub use quality::*;
