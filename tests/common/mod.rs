pub mod events;
pub mod operations;

#[allow(unused_imports)]
pub use events::*;
#[allow(unused_imports)]
pub use operations::*;
