mod correctness;
mod host_data;
mod outcome;
mod test_input;
mod test_mode;

pub use correctness::*;
pub use host_data::*;
pub use outcome::*;
pub use test_input::*;
pub use test_mode::*;
