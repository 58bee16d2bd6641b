// HTTP routes
pub mod batch;
pub mod health;
pub mod stream;

pub use batch::*;
pub use health::*;
pub use stream::*;
