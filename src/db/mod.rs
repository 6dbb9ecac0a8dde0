mod connection;
mod error;
mod executor;
#[cfg(feature = "postgres")]
mod pg;
mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::*;
pub use error::*;
pub use executor::*;
pub use value::*;
