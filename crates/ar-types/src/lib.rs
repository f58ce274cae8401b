pub mod errors;
pub mod objective;
pub mod space;
pub mod trial;

pub use errors::*;
pub use objective::*;
pub use space::*;
pub use trial::*;
