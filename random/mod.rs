pub mod gig;
pub mod normal;

pub use gig::{Gig, GigError, rgig};
pub use normal::{standard_normal_vector, stream};
