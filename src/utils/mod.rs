pub mod keyed_mutex;
pub mod range;
pub mod validation;
